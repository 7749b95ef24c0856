use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::process::{Command, Stdio};

use log::{debug, info};

use crate::compiler::CompiledModule;
use crate::diagnostics::{DiagnosticBag, Location};
use crate::sandbox::SandboxRecycler;
use crate::transformation::{
    render_session, TransformationReply, ENTRY_INITIALIZE, ENTRY_TRANSFORM_TEXT,
};

/// What one execution of a compiled module produced.
#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    /// Present only when `transform_text` completed.
    pub output: Option<String>,
    pub diagnostics: DiagnosticBag,
}

impl ExecutionOutcome {
    pub fn succeeded(&self) -> bool {
        self.output.is_some() && !self.diagnostics.has_errors()
    }
}

/// Runs compiled modules inside recycled sandboxes. Every failure is turned
/// into a diagnostic; nothing raised by the module reaches the caller.
#[derive(Clone, Default)]
pub struct ExecutionHost {
    recycler: SandboxRecycler,
}

impl ExecutionHost {
    pub fn new(recycler: SandboxRecycler) -> Self {
        Self { recycler }
    }

    pub fn recycler(&self) -> &SandboxRecycler {
        &self.recycler
    }

    /// `working_dir` becomes the module's current directory; `template_file`
    /// is where runtime diagnostics are attributed.
    pub fn run(
        &self,
        module: &CompiledModule,
        session: &BTreeMap<String, String>,
        working_dir: Option<&Path>,
        template_file: Option<&str>,
    ) -> ExecutionOutcome {
        let location = Location::new(template_file, -1, -1);
        let mut outcome = ExecutionOutcome::default();

        let handle = match self.recycler.acquire() {
            Ok(handle) => handle,
            Err(err) => {
                outcome.diagnostics.error(
                    "TT4001",
                    format!("failed to create execution sandbox: {err}"),
                    Some(location),
                );
                return outcome;
            }
        };
        let program = match handle.load_module(module) {
            Ok(program) => program,
            Err(err) => {
                outcome.diagnostics.error(
                    "TT4001",
                    format!("failed to load compiled template: {err}"),
                    Some(location),
                );
                return outcome;
            }
        };
        let reply_path = program.with_extension("reply");

        let mut command = Command::new(&program);
        command
            .arg(&reply_path)
            .current_dir(working_dir.unwrap_or_else(|| handle.path()))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        debug!("running {} in sandbox {}", program.display(), handle.id());

        let output = command.spawn().and_then(|mut child| {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(render_session(session).as_bytes())?;
            }
            child.wait_with_output()
        });
        let output = match output {
            Ok(output) => output,
            Err(err) => {
                outcome.diagnostics.error(
                    "TT4001",
                    format!("failed to run compiled template: {err}"),
                    Some(location),
                );
                return outcome;
            }
        };

        let reply = match fs::read_to_string(&reply_path) {
            Ok(text) => TransformationReply::parse(&text),
            Err(_) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let detail = stderr.lines().last().unwrap_or_default().trim();
                let message = if detail.is_empty() {
                    format!("transformation process exited with {} and no reply", output.status)
                } else {
                    format!(
                        "transformation process exited with {} and no reply: {detail}",
                        output.status
                    )
                };
                outcome.diagnostics.error("TT4001", message, Some(location));
                return outcome;
            }
        };
        drop(handle);

        for entry in [ENTRY_INITIALIZE, ENTRY_TRANSFORM_TEXT] {
            if !reply.has_entry(entry) {
                outcome.diagnostics.error(
                    "TT4002",
                    format!("template must have operation {entry}"),
                    Some(location.clone()),
                );
            }
        }
        if outcome.diagnostics.has_errors() {
            return outcome;
        }

        for message in reply.messages {
            if message.is_warning {
                outcome
                    .diagnostics
                    .warning("TT4004", message.message, Some(location.clone()));
            } else {
                outcome
                    .diagnostics
                    .error("TT4003", message.message, Some(location.clone()));
            }
        }
        outcome.output = reply.output;
        info!(
            "transformation finished with {} error(s)",
            outcome.diagnostics.error_count()
        );
        outcome
    }
}
