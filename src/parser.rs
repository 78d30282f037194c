use crate::command::{CommandChain, Redirects, Stage};
use crate::error::ShellError;
use std::path::PathBuf;

/// Longest input line, in bytes, the parser accepts.
pub const MAX_LINE_LEN: usize = 4096;

/// Markers found at the very end of a line. They apply to every stage.
#[derive(Debug, Clone, Copy, Default)]
struct LineFlags {
    background: bool,
    auto_complete: bool,
}

/// A whitespace-delimited piece of the line, with the byte offset just past it.
#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    text: &'a str,
    end: usize,
}

/// Splits a line on whitespace, keeping a quoted token such as `"a b"` whole.
#[derive(Debug, Clone)]
struct Tokenizer<'a> {
    line: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(line: &'a str) -> Self {
        Self { line, pos: 0 }
    }

    /// Offset of the first whitespace character at or after `from`.
    fn word_end(&self, from: usize) -> usize {
        self.line[from..]
            .find(char::is_whitespace)
            .map_or(self.line.len(), |i| from + i)
    }

    /// Offset just past the quote closing a token that opens with `quote` at
    /// `start`. The closing quote must be followed by whitespace or the end.
    fn quoted_end(&self, start: usize, quote: char) -> Option<usize> {
        let body = start + quote.len_utf8();
        let mut chars = self.line[body..].char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == quote && chars.peek().is_none_or(|&(_, next)| next.is_whitespace()) {
                return Some(body + i + quote.len_utf8());
            }
        }
        None
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        let skipped = self.line[self.pos..].len() - self.line[self.pos..].trim_start().len();
        let start = self.pos + skipped;
        let first = self.line[start..].chars().next()?;

        let end = match first {
            '"' | '\'' => self
                .quoted_end(start, first)
                .unwrap_or_else(|| self.word_end(start)),
            _ => self.word_end(start),
        };
        self.pos = end;
        Some(Token {
            text: &self.line[start..end],
            end,
        })
    }
}

/// Removes one pair of matching quotes wrapping the whole token. No escapes.
fn unquote(token: &str) -> &str {
    for quote in ['"', '\''] {
        if token.len() >= 2 && token.starts_with(quote) && token.ends_with(quote) {
            return &token[1..token.len() - 1];
        }
    }
    token
}

/// Records a redirect target. A marker written on its own (`> out.txt`)
/// borrows the next token, as long as that token isn't a pipe.
fn redirect_target(inline: &str, tokens: &mut Tokenizer<'_>) -> Option<PathBuf> {
    if !inline.is_empty() {
        return Some(PathBuf::from(unquote(inline)));
    }
    let mut lookahead = tokens.clone();
    match lookahead.next() {
        Some(next) if next.text != "|" && next.text != "&" => {
            *tokens = lookahead;
            Some(PathBuf::from(unquote(next.text)))
        }
        _ => None,
    }
}

/// Parses one stage off the front of `text` and recurses into whatever
/// follows a `|` token, appending every stage to `stages`.
fn parse_stage(text: &str, flags: LineFlags, stages: &mut Vec<Stage>) {
    let mut words = Vec::new();
    let mut redirects = Redirects::default();
    let mut rest = None;

    let mut tokens = Tokenizer::new(text);
    while let Some(token) = tokens.next() {
        match token.text {
            "|" => {
                rest = Some(&text[token.end..]);
                break;
            }
            "&" => {}
            t if t.starts_with('<') => {
                if let Some(target) = redirect_target(&t[1..], &mut tokens) {
                    redirects.input = Some(target);
                }
            }
            t if t.starts_with(">>") => {
                if let Some(target) = redirect_target(&t[2..], &mut tokens) {
                    redirects.append = Some(target);
                }
            }
            t if t.starts_with('>') => {
                if let Some(target) = redirect_target(&t[1..], &mut tokens) {
                    redirects.truncate = Some(target);
                }
            }
            t => words.push(unquote(t).to_string()),
        }
    }

    let mut stage = Stage::new(words);
    stage.background = flags.background;
    stage.auto_complete = flags.auto_complete;
    stage.redirects = redirects;
    tracing::debug!(target: "parse", ?stage, "parsed stage");
    stages.push(stage);

    if let Some(rest) = rest {
        parse_stage(rest.trim_start(), flags, stages);
    }
}

/// Turns one input line into a [`CommandChain`].
///
/// A blank line yields a single empty stage. Lines longer than
/// [`MAX_LINE_LEN`] are rejected rather than truncated.
pub fn parse_line(line: &str) -> Result<CommandChain, ShellError> {
    if line.len() > MAX_LINE_LEN {
        return Err(ShellError::ParseOverflow {
            len: line.len(),
            max: MAX_LINE_LEN,
        });
    }

    let mut text = line.trim();
    let mut flags = LineFlags::default();
    if let Some(stripped) = text.strip_suffix('?') {
        flags.auto_complete = true;
        text = stripped;
    } else if let Some(stripped) = text.strip_suffix('&') {
        flags.background = true;
        text = stripped;
    }

    let mut stages = Vec::new();
    parse_stage(text.trim_end(), flags, &mut stages);
    Ok(CommandChain { stages })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<Option<String>> {
        list.iter()
            .map(|s| Some(s.to_string()))
            .chain(std::iter::once(None))
            .collect()
    }

    fn single(line: &str) -> Stage {
        let mut chain = parse_line(line).unwrap();
        assert_eq!(chain.stages.len(), 1, "expected one stage for {line:?}");
        chain.stages.remove(0)
    }

    #[test]
    fn test_simple_command() {
        let stage = single("echo hi there");
        assert_eq!(stage.name, "echo");
        assert_eq!(stage.arguments, args(&["echo", "hi", "there"]));
        assert!(!stage.background);
        assert!(!stage.auto_complete);
        assert!(stage.redirects.is_empty());
    }

    #[test]
    fn test_argument_count_is_tokens_plus_two() {
        for line in ["ls", "ls -l", "grep -n foo bar.txt", "  printf  %s\tx  "] {
            let stage = single(line);
            let tokens = line.split_whitespace().count() - 1;
            assert_eq!(stage.arguments.len(), tokens + 2, "line {line:?}");
            assert_eq!(stage.arguments.last(), Some(&None));
        }
    }

    #[test]
    fn test_blank_line_is_empty_stage() {
        for line in ["", "   ", "\t"] {
            let chain = parse_line(line).unwrap();
            assert!(chain.is_noop());
            assert_eq!(chain.stages[0].name, "");
            assert!(chain.stages[0].arguments.is_empty());
        }
    }

    #[test]
    fn test_quoted_argument_stays_whole() {
        let stage = single(r#"echo "a b" 'c d' plain"#);
        assert_eq!(stage.arguments, args(&["echo", "a b", "c d", "plain"]));
    }

    #[test]
    fn test_quotes_are_stripped_verbatim() {
        let stage = single(r#"echo "it's" '"x"' "" ab"cd""#);
        assert_eq!(
            stage.arguments,
            args(&["echo", "it's", "\"x\"", "", "ab\"cd\""])
        );
    }

    #[test]
    fn test_unterminated_quote_falls_back_to_whitespace() {
        let stage = single(r#"echo "a b"#);
        assert_eq!(stage.arguments, args(&["echo", "\"a", "b"]));
    }

    #[test]
    fn test_pipeline_splits_on_raw_text() {
        let chain = parse_line("cat a.txt | wc -l").unwrap();
        assert_eq!(chain.stages.len(), 2);
        assert_eq!(chain.stages[0].arguments, args(&["cat", "a.txt"]));
        assert_eq!(chain.stages[1].arguments, args(&["wc", "-l"]));
    }

    #[test]
    fn test_three_stage_pipeline() {
        let chain = parse_line("ls -1 | sort -r | head -n 2").unwrap();
        let names: Vec<_> = chain.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["ls", "sort", "head"]);
    }

    #[test]
    fn test_pipe_inside_quotes_is_an_argument() {
        let stage = single(r#"echo "|" x"#);
        assert_eq!(stage.arguments, args(&["echo", "|", "x"]));
    }

    #[test]
    fn test_trailing_pipe_yields_empty_stage() {
        let chain = parse_line("ls |").unwrap();
        assert_eq!(chain.stages.len(), 2);
        assert!(chain.stages[1].is_empty());
    }

    #[test]
    fn test_redirections() {
        let stage = single("sort < in.txt >out.txt");
        assert_eq!(stage.arguments, args(&["sort"]));
        assert_eq!(stage.redirects.input, Some(PathBuf::from("in.txt")));
        assert_eq!(stage.redirects.truncate, Some(PathBuf::from("out.txt")));
        assert_eq!(stage.redirects.append, None);

        let stage = single("printf x >>log.txt");
        assert_eq!(stage.redirects.append, Some(PathBuf::from("log.txt")));
        assert_eq!(stage.redirects.truncate, None);
    }

    #[test]
    fn test_redirect_may_come_first() {
        let stage = single("<in.txt sort -u");
        assert_eq!(stage.name, "sort");
        assert_eq!(stage.arguments, args(&["sort", "-u"]));
        assert_eq!(stage.redirects.input, Some(PathBuf::from("in.txt")));
    }

    #[test]
    fn test_redirect_without_target_is_ignored() {
        let chain = parse_line("ls > | wc").unwrap();
        assert_eq!(chain.stages.len(), 2);
        assert!(chain.stages[0].redirects.is_empty());
    }

    #[test]
    fn test_redirects_stay_with_their_stage() {
        let chain = parse_line("cat <in.txt | wc -c >>count.txt").unwrap();
        assert_eq!(chain.stages[0].redirects.input, Some(PathBuf::from("in.txt")));
        assert_eq!(chain.stages[0].redirects.append, None);
        assert_eq!(chain.stages[1].redirects.input, None);
        assert_eq!(chain.stages[1].redirects.append, Some(PathBuf::from("count.txt")));
    }

    #[test]
    fn test_background_marker() {
        let stage = single("sleep 5 &");
        assert!(stage.background);
        assert_eq!(stage.arguments, args(&["sleep", "5"]));

        let stage = single("sleep 5&");
        assert!(stage.background);
        assert_eq!(stage.arguments, args(&["sleep", "5"]));
    }

    #[test]
    fn test_background_applies_to_every_stage() {
        let chain = parse_line("sleep 1 | cat &").unwrap();
        assert!(chain.is_background());
        assert!(chain.stages.iter().all(|s| s.background));
    }

    #[test]
    fn test_lone_ampersand_token_is_ignored() {
        let stage = single("echo a & b");
        assert!(!stage.background);
        assert_eq!(stage.arguments, args(&["echo", "a", "b"]));
    }

    #[test]
    fn test_auto_complete_marker() {
        let chain = parse_line("ech?").unwrap();
        assert!(chain.wants_completion());
        assert_eq!(chain.stages[0].name, "ech");
        assert!(!chain.is_background());
    }

    #[test]
    fn test_overflow_is_an_error() {
        let line = "a".repeat(MAX_LINE_LEN + 1);
        match parse_line(&line) {
            Err(ShellError::ParseOverflow { len, max }) => {
                assert_eq!(len, MAX_LINE_LEN + 1);
                assert_eq!(max, MAX_LINE_LEN);
            }
            other => panic!("expected overflow, got {other:?}"),
        }

        let line = "a".repeat(MAX_LINE_LEN);
        assert!(parse_line(&line).is_ok());
    }
}
