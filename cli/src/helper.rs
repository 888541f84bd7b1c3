use rustyline::{
    completion::{Completer, Pair},
    highlight::Highlighter,
    hint::Hinter,
    validate::Validator,
    Helper,
};

/// Completes the command word; arguments are addresses and names the shell
/// cannot guess.
#[derive(Helper)]
pub struct CliHelper {
    commands: Vec<String>,
}

impl CliHelper {
    pub fn new(commands: Vec<String>) -> CliHelper {
        CliHelper { commands }
    }

    fn candidates(&self, prefix: &str) -> Vec<Pair> {
        let mut candidates: Vec<Pair> = self
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .map(|c| Pair {
                display: c.clone(),
                replacement: c[prefix.len()..].to_owned(),
            })
            .collect();

        // collapse to the shared part so one tab extends as far as possible
        let shared = rustyline::completion::longest_common_prefix(&candidates)
            .map(|s| s.to_owned());
        if let Some(shared) = shared {
            if !shared.is_empty() && candidates.len() > 1 {
                candidates = vec![Pair {
                    display: format!("{}{}", prefix, shared),
                    replacement: shared,
                }];
            }
        }
        candidates
    }
}

impl Completer for CliHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _: &rustyline::Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Self::Candidate>)> {
        let prefix = &line[..pos];
        if prefix.trim_start() != prefix || prefix.contains(' ') {
            return Ok((pos, Vec::new()));
        }
        Ok((pos, self.candidates(prefix)))
    }
}

impl Validator for CliHelper {}

impl Hinter for CliHelper {
    type Hint = String;
}

impl Highlighter for CliHelper {}
