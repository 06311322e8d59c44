//! A minimal line-oriented interpreter.
//!
//! Each non-empty line is one command; `#` starts a comment line.
//!
//! | Command | Effect |
//! |---|---|
//! | `print <text>` | write `<text>\n` to stdout (`$name` expands) |
//! | `eprint <text>` | write `<text>\n` to stderr (`$name` expands) |
//! | `set <name> <value>` | define a variable, kept across executions |
//! | `sleep <ms>` | wait, honouring interrupts |
//! | `spin` | loop until interrupted |
//! | `busy <ms>` | burn CPU without checking for interrupts |
//! | `raise <message>` | fail with `<message>` |

use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use super::{ExecutionIo, Interpreter, RunError};

/// Granularity of interrupt checks while sleeping.
const SLEEP_SLICE: Duration = Duration::from_millis(5);

/// Interpreter for the command language above.
#[derive(Debug, Default)]
pub struct ScriptInterpreter {
    variables: FxHashMap<String, String>,
}

impl ScriptInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a variable.
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    fn expand(&self, text: &str) -> String {
        let mut names: Vec<&String> = self.variables.keys().collect();
        // Longest first so `$ab` is not clobbered by `$a`.
        names.sort_by_key(|name| std::cmp::Reverse(name.len()));

        let mut expanded = text.to_string();
        for name in names {
            expanded = expanded.replace(&format!("${}", name), &self.variables[name]);
        }
        expanded
    }

    fn execute_line(
        &mut self,
        line_no: usize,
        line: &str,
        io: &mut ExecutionIo<'_>,
    ) -> Result<(), RunError> {
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command {
            "print" => io.stdout(format!("{}\n", self.expand(rest))),
            "eprint" => io.stderr(format!("{}\n", self.expand(rest))),
            "set" => {
                let (name, value) = rest
                    .split_once(char::is_whitespace)
                    .map(|(name, value)| (name, value.trim()))
                    .unwrap_or((rest, ""));
                if name.is_empty() {
                    return Err(syntax_error(line_no, "set needs a variable name"));
                }
                let value = self.expand(value);
                self.variables.insert(name.to_string(), value);
            }
            "sleep" => {
                let deadline = Instant::now() + parse_millis(line_no, rest)?;
                while Instant::now() < deadline {
                    io.check_interrupt()?;
                    std::thread::sleep(SLEEP_SLICE.min(deadline.saturating_duration_since(Instant::now())));
                }
            }
            "spin" => loop {
                io.check_interrupt()?;
                std::thread::yield_now();
            },
            "busy" => {
                let deadline = Instant::now() + parse_millis(line_no, rest)?;
                while Instant::now() < deadline {
                    std::hint::spin_loop();
                }
            }
            "raise" => {
                let message = if rest.is_empty() { "Error" } else { rest };
                return Err(RunError::Raised(self.expand(message)));
            }
            other => {
                return Err(syntax_error(
                    line_no,
                    &format!("unknown command '{}'", other),
                ));
            }
        }
        Ok(())
    }
}

impl Interpreter for ScriptInterpreter {
    fn run(&mut self, code: &str, io: &mut ExecutionIo<'_>) -> Result<(), RunError> {
        tracing::trace!("Running {} lines for {}", code.lines().count(), io.id());
        for (index, raw) in code.lines().enumerate() {
            io.check_interrupt()?;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            self.execute_line(index + 1, line, io)?;
        }
        Ok(())
    }
}

fn syntax_error(line_no: usize, message: &str) -> RunError {
    RunError::Raised(format!("SyntaxError: {} on line {}", message, line_no))
}

fn parse_millis(line_no: usize, value: &str) -> Result<Duration, RunError> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| syntax_error(line_no, &format!("expected milliseconds, got '{}'", value)))
}
