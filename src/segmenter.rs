//! Sentence segmentation for incremental text
//!
//! Turns arbitrarily sized text fragments (down to single characters) into
//! speakable units. The first unit of a session may close on a comma so the
//! first audio arrives early; later units close on sentence punctuation only.
//! Punctuation directly after a digit is held until the next character shows
//! whether it was a terminator or part of a number such as `3.14` or `1,000`.

use futures_util::stream::{self, Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;

const SENTENCE_END: [char; 3] = ['.', '?', '!'];

/// Push-based boundary detector.
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buffer: String,
    /// Set once the first unit of the session has been emitted
    first_emitted: bool,
    /// Byte offset of punctuation that followed a digit and awaits context
    held: Option<usize>,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return every unit it completed, in order.
    pub fn feed(&mut self, fragment: &str) -> Vec<String> {
        let mut units = Vec::new();

        for ch in fragment.chars() {
            if let Some(at) = self.held.take() {
                if !ch.is_ascii_digit() {
                    self.close_at(at, &mut units);
                }
            }

            self.buffer.push(ch);

            if self.is_boundary(ch) {
                let end = self.buffer.len() - ch.len_utf8();
                let after_digit = self.buffer[..end]
                    .chars()
                    .next_back()
                    .is_some_and(|c| c.is_ascii_digit());

                if after_digit {
                    self.held = Some(end);
                } else {
                    self.close_at(end, &mut units);
                }
            }
        }

        units
    }

    /// End of stream: flush the remainder and start a fresh session.
    ///
    /// A whitespace-only remainder is dropped rather than emitted as an
    /// empty unit.
    pub fn finish(&mut self) -> Option<String> {
        self.held = None;
        self.first_emitted = false;
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            None
        } else {
            Some(rest)
        }
    }

    fn is_boundary(&self, ch: char) -> bool {
        SENTENCE_END.contains(&ch) || (!self.first_emitted && ch == ',')
    }

    /// Emit everything up to and including the punctuation at byte `at`.
    fn close_at(&mut self, at: usize, units: &mut Vec<String>) {
        let split = at + 1;
        let rest = self.buffer.split_off(split);
        let unit = std::mem::replace(&mut self.buffer, rest);
        units.push(unit);
        self.first_emitted = true;
    }
}

/// Segments a complete text in one go.
pub fn split_text(text: &str) -> Vec<String> {
    let mut segmenter = SentenceSegmenter::new();
    let mut units = segmenter.feed(text);
    units.extend(segmenter.finish());
    units
}

/// Lazily segments a stream of fragments; the remainder is flushed when the
/// source ends.
pub fn speakable_units<S>(fragments: S) -> impl Stream<Item = String>
where
    S: Stream<Item = String>,
{
    struct State<S> {
        fragments: Pin<Box<S>>,
        segmenter: SentenceSegmenter,
        ready: VecDeque<String>,
        ended: bool,
    }

    let state = State {
        fragments: Box::pin(fragments),
        segmenter: SentenceSegmenter::new(),
        ready: VecDeque::new(),
        ended: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(unit) = st.ready.pop_front() {
                return Some((unit, st));
            }
            if st.ended {
                return None;
            }
            match st.fragments.next().await {
                Some(fragment) => {
                    let units = st.segmenter.feed(&fragment);
                    st.ready.extend(units);
                }
                None => {
                    st.ended = true;
                    st.ready.extend(st.segmenter.finish());
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn feed_all(fragments: &[&str]) -> Vec<String> {
        let mut seg = SentenceSegmenter::new();
        let mut out = Vec::new();
        for f in fragments {
            out.extend(seg.feed(f));
        }
        out.extend(seg.finish());
        out
    }

    fn random_fragments(text: &str, rng: &mut impl Rng) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let mut out = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            let len = rng.random_range(1..=5).min(chars.len() - i);
            out.push(chars[i..i + len].iter().collect());
            i += len;
        }
        out
    }

    #[test]
    fn test_first_unit_closes_on_comma() {
        let units = split_text("Hi, how are you? I am 3.5 years old.");
        assert_eq!(units, vec!["Hi,", " how are you?", " I am 3.5 years old."]);
    }

    #[test]
    fn test_single_character_fragments() {
        let text = "Hi, how are you? I am 3.5 years old.";
        let chars: Vec<String> = text.chars().map(String::from).collect();
        let refs: Vec<&str> = chars.iter().map(String::as_str).collect();
        assert_eq!(feed_all(&refs), split_text(text));
    }

    #[test]
    fn test_decimal_split_across_fragments() {
        let units = feed_all(&["version 3", ".", "14 released. Next"]);
        assert_eq!(units, vec!["version 3.14 released.", " Next"]);
    }

    #[test]
    fn test_digit_then_period_terminates_sentence() {
        let units = feed_all(&["I counted to 10. Then ", "I stopped."]);
        assert_eq!(units, vec!["I counted to 10.", " Then I stopped."]);
    }

    #[test]
    fn test_trailing_number_flushed_at_end() {
        let mut seg = SentenceSegmenter::new();
        assert!(seg.feed("The answer is 42.").is_empty());
        assert_eq!(seg.finish().as_deref(), Some("The answer is 42."));
    }

    #[test]
    fn test_later_commas_do_not_split() {
        let units = split_text("Well. Hello, this is a test, with commas. Done!");
        assert_eq!(units, vec!["Well.", " Hello, this is a test, with commas.", " Done!"]);
    }

    #[test]
    fn test_thousands_separator_in_first_unit() {
        let units = split_text("About 1,000 people came, then left.");
        assert_eq!(units, vec!["About 1,000 people came,", " then left."]);
    }

    #[test]
    fn test_whitespace_remainder_is_dropped() {
        let mut seg = SentenceSegmenter::new();
        assert_eq!(seg.feed("Done.  "), vec!["Done."]);
        assert_eq!(seg.finish(), None);
        assert_eq!(seg.finish(), None);
    }

    #[test]
    fn test_finish_starts_new_session() {
        let mut seg = SentenceSegmenter::new();
        assert_eq!(seg.feed("One, two, "), vec!["One,"]);
        assert_eq!(seg.finish().as_deref(), Some(" two, "));
        assert_eq!(seg.feed("Again, yes."), vec!["Again,", " yes."]);
    }

    #[test]
    fn test_multibyte_text() {
        let units = split_text("Café, très bien! Ça va?");
        assert_eq!(units, vec!["Café,", " très bien!", " Ça va?"]);
    }

    #[test]
    fn test_random_fragmentation_is_lossless() {
        let texts = [
            "Hello, this is a test, with multiple commas. This is the second sentence! And a third? With numbers like 3.14 and 1.000 intact.",
            "version 3.14 released. Pi is 3.14159, roughly. Ok!",
            "No punctuation at all in this one",
            "...!?,,",
            "Price: 9.99. Tax 0.5! Total 10.49? yes",
        ];
        let mut rng = rand::rng();

        for text in texts {
            let expected = split_text(text);
            for _ in 0..50 {
                let fragments = random_fragments(text, &mut rng);
                let refs: Vec<&str> = fragments.iter().map(String::as_str).collect();
                let units = feed_all(&refs);

                assert_eq!(units.concat(), text);
                assert_eq!(units, expected);
                assert!(units.iter().all(|u| !u.trim().is_empty()));
                for (i, unit) in units.iter().enumerate() {
                    if i + 1 < units.len() {
                        if i > 0 {
                            assert!(!unit.ends_with(','), "late comma split in {:?}", units);
                        }
                        let next = &units[i + 1];
                        let digit_dot = unit.ends_with('.')
                            && unit[..unit.len() - 1].ends_with(|c: char| c.is_ascii_digit())
                            && next.starts_with(|c: char| c.is_ascii_digit());
                        assert!(!digit_dot, "decimal split in {:?}", units);
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_speakable_units_stream() {
        let fragments = stream::iter(
            ["Sure", ", here", " it is. Pi is 3", ".14 and", " more"]
                .into_iter()
                .map(String::from),
        );
        let units: Vec<String> = speakable_units(fragments).collect().await;
        assert_eq!(units, vec!["Sure,", " here it is.", " Pi is 3.14 and more"]);
    }
}
