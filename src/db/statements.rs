//! Incremental splitter turning a dump file into executable statements.
//!
//! Input arrives line by line so a dump is never held in memory. A `;` ends a
//! statement only outside string literals, quoted identifiers and comments.
//! Line comments (`-- `, `#`) are dropped; block comments are kept because
//! MySQL executes `/*!40101 ... */` version comments.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SplitError {
    #[error("dump ends inside a quoted value starting with {quote}")]
    UnterminatedQuote { quote: char },
    #[error("dump ends inside a block comment")]
    UnterminatedComment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    Quoted(char),
    BlockComment,
}

#[derive(Debug)]
pub struct StatementSplitter {
    buffer: String,
    state: State,
}

impl Default for StatementSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatementSplitter {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            state: State::Normal,
        }
    }

    /// Feeds one line (without its terminator) and returns the statements it
    /// completed.
    pub fn push_line(&mut self, line: &str) -> Vec<String> {
        let mut done = Vec::new();
        let chars: Vec<char> = line.chars().collect();
        let mut i = 0;

        while i < chars.len() {
            let ch = chars[i];
            let next = chars.get(i + 1).copied();
            match self.state {
                State::Normal => match ch {
                    '\'' | '"' | '`' => {
                        self.state = State::Quoted(ch);
                        self.buffer.push(ch);
                    }
                    '-' if next == Some('-')
                        && chars.get(i + 2).map_or(true, |c| c.is_whitespace()) =>
                    {
                        break;
                    }
                    '#' => break,
                    '/' if next == Some('*') => {
                        self.state = State::BlockComment;
                        self.buffer.push_str("/*");
                        i += 1;
                    }
                    ';' => {
                        let statement = self.buffer.trim();
                        if !statement.is_empty() {
                            done.push(statement.to_string());
                        }
                        self.buffer.clear();
                    }
                    other => self.buffer.push(other),
                },
                State::Quoted(quote) => {
                    self.buffer.push(ch);
                    if ch == '\\' && quote != '`' {
                        if let Some(escaped) = next {
                            self.buffer.push(escaped);
                            i += 1;
                        }
                    } else if ch == quote {
                        if next == Some(quote) {
                            self.buffer.push(quote);
                            i += 1;
                        } else {
                            self.state = State::Normal;
                        }
                    }
                }
                State::BlockComment => {
                    self.buffer.push(ch);
                    if ch == '*' && next == Some('/') {
                        self.buffer.push('/');
                        self.state = State::Normal;
                        i += 1;
                    }
                }
            }
            i += 1;
        }

        if !self.buffer.is_empty() {
            self.buffer.push('\n');
        }
        done
    }

    /// Returns the trailing statement that was not terminated by `;`.
    pub fn finish(self) -> Result<Option<String>, SplitError> {
        match self.state {
            State::Quoted(quote) => Err(SplitError::UnterminatedQuote { quote }),
            State::BlockComment => Err(SplitError::UnterminatedComment),
            State::Normal => {
                let rest = self.buffer.trim();
                Ok((!rest.is_empty()).then(|| rest.to_string()))
            }
        }
    }
}

/// Convenience for splitting a dump that is already in memory.
pub fn split_all(sql: &str) -> Result<Vec<String>, SplitError> {
    let mut splitter = StatementSplitter::new();
    let mut out = Vec::new();
    for line in sql.lines() {
        out.extend(splitter.push_line(line));
    }
    out.extend(splitter.finish()?);
    Ok(out)
}
