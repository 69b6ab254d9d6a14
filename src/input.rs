//! Input providers for procedures that need answers from an operator.
//!
//! Procedures declare the answers they need as [`InputRequest`]s. Before the
//! run starts, [`resolve_inputs`] fills in every request not already given on
//! the command line, using whichever [`InputProvider`] the CLI selected:
//!
//! - [`PromptInput`]: asks on the terminal, one line per answer
//! - [`PresetInput`]: answers from a map (config file, flags)
//! - [`NonInteractive`]: defaults only, for cron and CI

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Stdin, Write};
use std::sync::Mutex;

use tracing::debug;

use crate::context::Params;
use crate::error::InputError;

/// An answer a procedure needs before it can run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRequest {
    pub key: String,
    pub prompt: String,
    pub default: Option<String>,
    /// An empty answer is rejected when true
    pub required: bool,
}

impl InputRequest {
    pub fn required(key: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            prompt: prompt.into(),
            default: None,
            required: true,
        }
    }

    pub fn optional(key: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            prompt: prompt.into(),
            default: None,
            required: false,
        }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Source of operator answers
pub trait InputProvider: Send + Sync {
    /// Return the raw answer (possibly empty) for `request`
    fn ask(&self, request: &InputRequest) -> Result<String, InputError>;
}

/// Line-oriented prompt over any reader/writer pair
pub struct PromptInput<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
}

impl PromptInput<BufReader<Stdin>, io::Stderr> {
    /// Prompt on stderr, read answers from stdin
    pub fn stdin() -> Self {
        Self::new(BufReader::new(io::stdin()), io::stderr())
    }
}

impl<R: BufRead, W: Write> PromptInput<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

impl<R: BufRead + Send, W: Write + Send> InputProvider for PromptInput<R, W> {
    fn ask(&self, request: &InputRequest) -> Result<String, InputError> {
        {
            let mut writer = self
                .writer
                .lock()
                .map_err(|_| InputError::Read("prompt writer poisoned".to_string()))?;
            let prompt = match &request.default {
                Some(default) => format!("{} [{}]: ", request.prompt, default),
                None => format!("{}: ", request.prompt),
            };
            writer
                .write_all(prompt.as_bytes())
                .and_then(|_| writer.flush())
                .map_err(|e| InputError::Read(e.to_string()))?;
        }

        let mut reader = self
            .reader
            .lock()
            .map_err(|_| InputError::Read("prompt reader poisoned".to_string()))?;
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| InputError::Read(e.to_string()))?;
        if read == 0 {
            return Err(InputError::Closed(request.key.clone()));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Answers supplied up front
#[derive(Debug, Clone, Default)]
pub struct PresetInput {
    answers: BTreeMap<String, String>,
}

impl PresetInput {
    pub fn new(answers: BTreeMap<String, String>) -> Self {
        Self { answers }
    }

    pub fn answer(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.answers.insert(key.into(), value.into());
        self
    }
}

impl InputProvider for PresetInput {
    fn ask(&self, request: &InputRequest) -> Result<String, InputError> {
        match self.answers.get(&request.key) {
            Some(answer) => Ok(answer.clone()),
            None if request.default.is_some() || !request.required => Ok(String::new()),
            None => Err(InputError::Unavailable(request.key.clone())),
        }
    }
}

/// Unattended mode: only defaults are available
#[derive(Debug, Clone, Copy, Default)]
pub struct NonInteractive;

impl InputProvider for NonInteractive {
    fn ask(&self, request: &InputRequest) -> Result<String, InputError> {
        if request.default.is_some() || !request.required {
            Ok(String::new())
        } else {
            Err(InputError::Unavailable(request.key.clone()))
        }
    }
}

/// Fill `params` with an answer for every request it does not already hold.
///
/// An empty answer falls back to the request's default; an empty answer to
/// a required request without default is an error.
pub fn resolve_inputs(
    requests: &[InputRequest],
    params: &mut Params,
    provider: &dyn InputProvider,
) -> Result<(), InputError> {
    for request in requests {
        if params.get(&request.key).is_some_and(|v| !v.trim().is_empty()) {
            continue;
        }
        let answer = provider.ask(request)?;
        let answer = answer.trim();
        let value = if answer.is_empty() {
            match (&request.default, request.required) {
                (Some(default), _) => default.clone(),
                (None, true) => return Err(InputError::Unavailable(request.key.clone())),
                (None, false) => continue,
            }
        } else {
            answer.to_string()
        };
        debug!("Resolved input '{}'", request.key);
        params.insert(request.key.clone(), value);
    }
    Ok(())
}
