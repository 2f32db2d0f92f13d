//! Single-pass scanner that turns raw upstream tokens into a display stream
//! (markers stripped, product blocks emitted atomically) and a
//! marker-annotated stream (kept verbatim for later analysis), following the
//! two-stream design of the conversation pipeline this crate reimplements.

use serde::{Deserialize, Serialize};

type FlagSetter = fn(&mut MarkerFlags);
const FLAG_MARKERS: [(&str, FlagSetter); 4] = [
    ("%%", |f| f.contact_form = true),
    ("$$", |f| f.freshdesk = true),
    ("&&", |f| f.human_agent = true),
    ("i#", |f| f.image_upload = true),
];
const PRODUCT_START: &str = "XXX";
const PRODUCT_END: &str = "YYY";
const BUFFERING_START: &str = "BUFFERING_START";
const BUFFERING_END: &str = "BUFFERING_END";

/// Markers detected while producing a given display fragment. `$$`/`&&`/`i#`
/// are kept verbatim in the annotated stream; `%%` is stripped from both
/// (the design notes leave this asymmetric by omission — §4.5 says "keep in
/// marker-annotated stream" for the other three and says nothing of the
/// kind for `%%`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerFlags {
    #[serde(rename = "contactForm", skip_serializing_if = "is_false", default)]
    pub contact_form: bool,
    #[serde(skip_serializing_if = "is_false", default)]
    pub freshdesk: bool,
    #[serde(rename = "humanAgent", skip_serializing_if = "is_false", default)]
    pub human_agent: bool,
    #[serde(rename = "imageUpload", skip_serializing_if = "is_false", default)]
    pub image_upload: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl MarkerFlags {
    fn any(&self) -> bool {
        self.contact_form || self.freshdesk || self.human_agent || self.image_upload
    }
}

/// One display-stream fragment, corresponding to one `token` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
    pub markers: MarkerFlags,
}

/// Streaming-safe marker scanner. Owns the accumulators that feed the
/// `end` event and the persistence step (`display_text`/`annotated_text`),
/// plus the small trailing-context carry needed to recognise markers that
/// straddle two upstream tokens.
#[derive(Debug, Default)]
pub struct MarkerMachine {
    carry: String,
    buffering: bool,
    buffer: String,
    pending_flags: MarkerFlags,
    display_text: String,
    annotated_text: String,
}

impl MarkerMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn display_text(&self) -> &str {
        &self.display_text
    }

    pub fn annotated_text(&self) -> &str {
        &self.annotated_text
    }

    /// Feed one upstream `token` payload through the machine, returning the
    /// display fragments it produces (zero, one, or several).
    pub fn feed(&mut self, token: &str) -> Vec<Fragment> {
        let mut out = Vec::new();
        let mut combined = std::mem::take(&mut self.carry);
        combined.push_str(token);
        let mut pos = 0usize;

        loop {
            if pos >= combined.len() {
                break;
            }
            if self.buffering {
                match combined[pos..].find(PRODUCT_END) {
                    Some(rel) => {
                        let end = pos + rel + PRODUCT_END.len();
                        self.buffer.push_str(&combined[pos..end]);
                        let block = std::mem::take(&mut self.buffer);
                        self.display_text.push_str(&block);
                        self.annotated_text.push_str(&block);
                        let mut text = block;
                        text.push_str(BUFFERING_END);
                        out.push(Fragment {
                            text,
                            markers: MarkerFlags::default(),
                        });
                        self.buffering = false;
                        pos = end;
                    }
                    None => {
                        let held = partial_suffix_len(&combined[pos..], &[PRODUCT_END]);
                        let safe = combined[pos..].len() - held;
                        self.buffer.push_str(&combined[pos..pos + safe]);
                        self.carry = combined[pos + safe..].to_string();
                        break;
                    }
                }
            } else {
                match find_earliest(&combined[pos..]) {
                    Some((rel, hit)) => {
                        let idx = pos + rel;
                        if idx > pos {
                            self.flush_plain(&combined[pos..idx], &mut out);
                        }
                        match hit {
                            Hit::Product => {
                                self.buffering = true;
                                self.buffer.clear();
                                self.buffer.push_str(PRODUCT_START);
                                out.push(Fragment {
                                    text: BUFFERING_START.to_string(),
                                    markers: std::mem::take(&mut self.pending_flags),
                                });
                                pos = idx + PRODUCT_START.len();
                            }
                            Hit::Flag(marker, setter) => {
                                setter(&mut self.pending_flags);
                                if marker != "%%" {
                                    self.annotated_text.push_str(marker);
                                }
                                pos = idx + marker.len();
                            }
                        }
                    }
                    None => {
                        let held =
                            partial_suffix_len(&combined[pos..], &["XXX", "%%", "$$", "&&", "i#"]);
                        let safe = combined[pos..].len() - held;
                        if safe > 0 {
                            self.flush_plain(&combined[pos..pos + safe], &mut out);
                        }
                        self.carry = combined[pos + safe..].to_string();
                        break;
                    }
                }
            }
        }
        out
    }

    /// Called on the upstream `end` event. Flushes any unresolved carry as
    /// plain text and, per §4.5, flushes an unterminated product block
    /// verbatim (no `BUFFERING_END`, since none was observed).
    pub fn finish(&mut self) -> Vec<Fragment> {
        let mut out = Vec::new();
        if !self.carry.is_empty() {
            let carry = std::mem::take(&mut self.carry);
            self.flush_plain(&carry, &mut out);
        }
        if self.buffering && !self.buffer.is_empty() {
            let text = std::mem::take(&mut self.buffer);
            self.display_text.push_str(&text);
            self.annotated_text.push_str(&text);
            out.push(Fragment {
                text,
                markers: std::mem::take(&mut self.pending_flags),
            });
            self.buffering = false;
        } else if self.pending_flags.any() {
            out.push(Fragment {
                text: String::new(),
                markers: std::mem::take(&mut self.pending_flags),
            });
        }
        out
    }

    fn flush_plain(&mut self, text: &str, out: &mut Vec<Fragment>) {
        if text.is_empty() && !self.pending_flags.any() {
            return;
        }
        self.display_text.push_str(text);
        self.annotated_text.push_str(text);
        out.push(Fragment {
            text: text.to_string(),
            markers: std::mem::take(&mut self.pending_flags),
        });
    }
}

enum Hit<'a> {
    Product,
    Flag(&'a str, FlagSetter),
}

fn find_earliest(s: &str) -> Option<(usize, Hit<'static>)> {
    let mut best: Option<(usize, Hit<'static>)> = None;
    if let Some(i) = s.find(PRODUCT_START) {
        best = Some((i, Hit::Product));
    }
    for (marker, setter) in FLAG_MARKERS.iter() {
        if let Some(i) = s.find(marker) {
            if best.as_ref().map(|(b, _)| i < *b).unwrap_or(true) {
                best = Some((i, Hit::Flag(marker, *setter)));
            }
        }
    }
    best
}

/// Longest suffix of `s` that is a proper prefix of one of `candidates`,
/// i.e. text that must be held back because more input could turn it into
/// a marker. Returns 0 if no such suffix exists.
fn partial_suffix_len(s: &str, candidates: &[&str]) -> usize {
    let mut best = 0usize;
    for candidate in candidates {
        let max_k = candidate.len().saturating_sub(1).min(s.len());
        for k in (1..=max_k).rev() {
            if s.ends_with(&candidate[..k]) {
                best = best.max(k);
                break;
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_all(tokens: &[&str]) -> (Vec<Fragment>, String, String) {
        let mut m = MarkerMachine::new();
        let mut frags = Vec::new();
        for t in tokens {
            frags.extend(m.feed(t));
        }
        frags.extend(m.finish());
        (frags, m.display_text().to_string(), m.annotated_text().to_string())
    }

    #[test]
    fn e1_simple_turn() {
        // The trailing "i" of "Hi" is a proper prefix of the "i#" marker, so
        // it is held back across the token boundary rather than flushed
        // with "H" - the same carry logic that lets "%%"/"i#" be recognised
        // when a marker straddles two upstream tokens.
        let (frags, display, _) = run_all(&["Hi", " there"]);
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[0].text, "H");
        assert_eq!(frags[0].markers, MarkerFlags::default());
        assert_eq!(frags[1].text, "i there");
        assert_eq!(display, "Hi there");
    }

    #[test]
    fn e2_contact_marker_across_chunks() {
        let (frags, display, _) = run_all(&["Sure%", "%please"]);
        let texts: Vec<&str> = frags.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(texts, vec!["Sure", "please"]);
        assert_eq!(display, "Sureplease");
        assert!(frags.iter().any(|f| f.markers.contact_form));
        assert_eq!(frags.iter().filter(|f| f.markers.contact_form).count(), 1);
    }

    #[test]
    fn e3_product_block() {
        let (frags, display, annotated) = run_all(&["See ", "XXXitem-1", "YYY and more"]);
        let texts: Vec<&str> = frags.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["See ", "BUFFERING_START", "XXXitem-1YYYBUFFERING_END", " and more"]
        );
        assert_eq!(display, "See XXXitem-1YYY and more");
        assert_eq!(annotated, "See XXXitem-1YYY and more");
    }

    #[test]
    fn unterminated_product_block_flushes_on_finish() {
        let mut m = MarkerMachine::new();
        let mut frags = m.feed("XXXpartial");
        frags.extend(m.finish());
        let texts: Vec<&str> = frags.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(texts, vec!["BUFFERING_START", "XXXpartial"]);
    }

    #[test]
    fn dollar_and_amp_markers_kept_in_annotated_not_display() {
        let (frags, display, annotated) = run_all(&["open $", "$ticket && escalate"]);
        let texts: Vec<&str> = frags.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(texts.join(""), display);
        assert!(!display.contains("$$"));
        assert!(!display.contains("&&"));
        assert!(annotated.contains("$$"));
        assert!(annotated.contains("&&"));
    }

    #[test]
    fn percent_marker_stripped_from_annotated_too() {
        let (_frags, _display, annotated) = run_all(&["hi %%", "there"]);
        assert!(!annotated.contains("%%"));
    }

    #[test]
    fn determinism_across_arbitrary_partitions() {
        let text = "before %%XXXproductYYY after $$ and && and i# end";
        let (_, base_display, base_annotated) = run_all(&[text]);

        let partitions: Vec<Vec<&str>> = vec![
            text.split_inclusive(' ').collect(),
            text.as_bytes()
                .chunks(3)
                .map(|c| std::str::from_utf8(c).unwrap())
                .collect(),
            vec![&text[..5], &text[5..20], &text[20..]],
        ];
        for tokens in partitions {
            let (_, display, annotated) = run_all(&tokens);
            assert_eq!(display, base_display);
            assert_eq!(annotated, base_annotated);
        }
    }

    #[test]
    fn no_token_between_buffering_start_and_end() {
        let (frags, _, _) = run_all(&["a", "XXX", "b", "c", "YYY", "d"]);
        let start = frags.iter().position(|f| f.text == "BUFFERING_START").unwrap();
        let end = frags
            .iter()
            .position(|f| f.text.ends_with("BUFFERING_END"))
            .unwrap();
        assert_eq!(end, start + 1, "exactly one fragment between start and end sentinels");
    }
}
