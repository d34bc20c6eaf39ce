use serde::{Deserialize, Serialize};

/// Bracket kinds recognised around fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bracket {
    /// `(` `)` concurrency group.
    Paren,
    /// `[` `]` repeat region.
    Square,
}

/// A closing bracket with the repeat spec that followed it, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close {
    /// Which bracket closes.
    pub kind: Bracket,
    /// Raw text after `^` (`Some("")` for a bare caret).
    pub spec: Option<String>,
}

/// One comma separated piece of a sequence, with decorations split off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// Position in the sequence.
    pub index: usize,
    /// Full fragment text.
    pub text: String,
    /// Leading opening brackets in reading order.
    pub opens: Vec<Bracket>,
    /// Residual token text.
    pub core: String,
    /// Trailing closing brackets in reading order.
    pub closes: Vec<Close>,
    /// Anything after the closes that is not another close.
    pub trailing: String,
}

/// Upper-case the sequence and drop all whitespace.
pub fn normalize(source: &str) -> String {
    source
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Split a normalised sequence into fragments.
pub fn lex(normalized: &str) -> Vec<Fragment> {
    if normalized.is_empty() {
        return Vec::new();
    }
    normalized
        .split(',')
        .enumerate()
        .map(|(index, text)| Scanner::new(text).fragment(index))
        .collect()
}

struct Scanner<'a> {
    src: &'a str,
    bytes: &'a [u8],
    index: usize,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            index: 0,
        }
    }

    fn current(&self) -> Option<u8> {
        self.bytes.get(self.index).copied()
    }

    fn advance(&mut self) {
        if self.index < self.bytes.len() {
            self.index += 1;
        }
    }

    fn take_until_close(&mut self) -> &'a str {
        let start = self.index;
        while let Some(ch) = self.current() {
            if ch == b')' || ch == b']' {
                break;
            }
            self.advance();
        }
        &self.src[start..self.index]
    }

    fn fragment(mut self, index: usize) -> Fragment {
        let mut opens = Vec::new();
        while let Some(ch) = self.current() {
            match ch {
                b'(' => opens.push(Bracket::Paren),
                b'[' => opens.push(Bracket::Square),
                _ => break,
            }
            self.advance();
        }

        let core = self.take_until_close().to_string();

        let mut closes = Vec::new();
        loop {
            match self.current() {
                Some(b')') => {
                    self.advance();
                    closes.push(Close {
                        kind: Bracket::Paren,
                        spec: None,
                    });
                }
                Some(b']') => {
                    self.advance();
                    let spec = if self.current() == Some(b'^') {
                        self.advance();
                        Some(self.take_until_close().to_string())
                    } else {
                        None
                    };
                    closes.push(Close {
                        kind: Bracket::Square,
                        spec,
                    });
                }
                _ => break,
            }
        }

        Fragment {
            index,
            text: self.src.to_string(),
            opens,
            core,
            closes,
            trailing: self.src[self.index..].to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_uppercases_and_strips_whitespace() {
        assert_eq!(normalize(" a+, b- ,\t3s "), "A+,B-,3S");
    }

    #[test]
    fn lex_splits_decorations() {
        let fragments = lex("[(A-,B-)]^N+2");
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].opens, vec![Bracket::Square, Bracket::Paren]);
        assert_eq!(fragments[0].core, "A-");
        assert_eq!(fragments[1].core, "B-");
        assert_eq!(
            fragments[1].closes,
            vec![
                Close { kind: Bracket::Paren, spec: None },
                Close { kind: Bracket::Square, spec: Some("N+2".into()) },
            ]
        );
        assert!(fragments[1].trailing.is_empty());
    }

    #[test]
    fn lex_keeps_garbage_after_closes() {
        let fragments = lex("(B-,C-)]20");
        assert_eq!(fragments[1].closes.len(), 2);
        assert_eq!(fragments[1].trailing, "20");
    }

    #[test]
    fn lex_bare_caret_yields_empty_spec() {
        let fragments = lex("[A+,3S]^");
        assert_eq!(fragments[1].closes[0].spec.as_deref(), Some(""));
    }

    #[test]
    fn lex_keeps_empty_fragments() {
        let fragments = lex("A+,,B+");
        assert_eq!(fragments.len(), 3);
        assert!(fragments[1].text.is_empty());
    }
}
