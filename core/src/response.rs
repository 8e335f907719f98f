//! Parsing of model responses into ACTION or FINAL blocks.
//!
//! The markers are line-anchored: a line consisting of `ACTION` opens a
//! block closed by `END_ACTION`, and likewise `FINAL`/`END_FINAL`. A
//! well-formed response contains exactly one block.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedResponse {
    Action { code: String },
    Final { answer: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedKind {
    /// Neither marker present.
    NoBlock,
    /// More than one block present.
    MultipleBlocks,
    /// An opening marker without its end marker.
    Unterminated,
}

impl MalformedKind {
    /// Hint included in the repair re-prompt.
    pub fn repair_hint(self) -> &'static str {
        match self {
            MalformedKind::NoBlock => {
                "Your last reply contained no ACTION or FINAL block. Reply with exactly one \
                 block: either ACTION / END_ACTION around sandbox code, or FINAL / END_FINAL \
                 around your answer."
            }
            MalformedKind::MultipleBlocks => {
                "Your last reply contained more than one block. Reply with exactly one ACTION \
                 or FINAL block."
            }
            MalformedKind::Unterminated => {
                "Your last block was never closed. Close ACTION with END_ACTION and FINAL with \
                 END_FINAL."
            }
        }
    }
}

pub fn parse_response(text: &str) -> Result<ParsedResponse, MalformedKind> {
    #[derive(PartialEq)]
    enum Mode {
        Outside,
        InAction,
        InFinal,
    }

    let mut mode = Mode::Outside;
    let mut body: Vec<&str> = Vec::new();
    let mut found: Option<ParsedResponse> = None;

    for line in text.lines() {
        let marker = line.trim_end();
        match mode {
            Mode::Outside => match marker {
                "ACTION" => {
                    mode = Mode::InAction;
                    body.clear();
                }
                "FINAL" => {
                    mode = Mode::InFinal;
                    body.clear();
                }
                _ => {}
            },
            Mode::InAction => {
                if marker == "END_ACTION" {
                    if found.is_some() {
                        return Err(MalformedKind::MultipleBlocks);
                    }
                    found = Some(ParsedResponse::Action {
                        code: body.join("\n"),
                    });
                    mode = Mode::Outside;
                } else {
                    body.push(line);
                }
            }
            Mode::InFinal => {
                if marker == "END_FINAL" {
                    if found.is_some() {
                        return Err(MalformedKind::MultipleBlocks);
                    }
                    found = Some(ParsedResponse::Final {
                        answer: body.join("\n").trim().to_string(),
                    });
                    mode = Mode::Outside;
                } else {
                    body.push(line);
                }
            }
        }
    }

    if mode != Mode::Outside {
        return Err(MalformedKind::Unterminated);
    }
    found.ok_or(MalformedKind::NoBlock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_action_block() {
        let text = "thinking...\nACTION\nx = nav.get_function(\"run\")\nprint(x)\nEND_ACTION\n";
        assert_eq!(
            parse_response(text),
            Ok(ParsedResponse::Action {
                code: "x = nav.get_function(\"run\")\nprint(x)".to_string()
            })
        );
    }

    #[test]
    fn parses_final_block_trimmed() {
        let text = "FINAL\n\nThe default is 100.0.\n\nEND_FINAL";
        assert_eq!(
            parse_response(text),
            Ok(ParsedResponse::Final {
                answer: "The default is 100.0.".to_string()
            })
        );
    }

    #[test]
    fn prose_without_blocks_is_malformed() {
        assert_eq!(
            parse_response("I think the answer is 42."),
            Err(MalformedKind::NoBlock)
        );
    }

    #[test]
    fn two_blocks_are_malformed() {
        let text = "ACTION\nprint(1)\nEND_ACTION\nFINAL\ndone\nEND_FINAL";
        assert_eq!(parse_response(text), Err(MalformedKind::MultipleBlocks));
    }

    #[test]
    fn unterminated_block_is_malformed() {
        assert_eq!(
            parse_response("ACTION\nprint(1)"),
            Err(MalformedKind::Unterminated)
        );
    }

    #[test]
    fn markers_must_be_line_anchored() {
        assert_eq!(
            parse_response("the ACTION marker inline does not count"),
            Err(MalformedKind::NoBlock)
        );
    }

    #[test]
    fn trailing_whitespace_on_markers_is_tolerated() {
        let text = "ACTION  \nprint(1)\nEND_ACTION\t\n";
        assert!(matches!(parse_response(text), Ok(ParsedResponse::Action { .. })));
    }
}
