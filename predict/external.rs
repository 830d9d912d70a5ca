//! A [`ModelBackend`] that lives in another runtime.
//!
//! The published cDIP regressor was historically evaluated in a different
//! language runtime from the caller. This backend keeps that deployment option
//! open without leaking it into the pipeline: each call spawns the configured
//! program, writes the design matrix to its stdin as TSV (header in canonical
//! order) and reads one line per record from its stdout, each holding
//! `output_width` tab-separated numbers.
//!
//! The call is blocking. If the program has not produced its full answer
//! within the timeout it is killed and the batch fails.

use crate::data::Biomarker;
use crate::model::{ModelBackend, ModelError};
use crossbeam_channel::{RecvTimeoutError, bounded};
use ndarray::{Array2, ArrayView2};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ExternalBackend {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    output_width: usize,
}

impl ExternalBackend {
    pub fn new(
        name: impl Into<String>,
        program: impl Into<PathBuf>,
        args: Vec<String>,
        timeout: Duration,
        output_width: usize,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            timeout,
            output_width,
        }
    }

    fn program_label(&self) -> String {
        self.program.display().to_string()
    }

    fn process_error(&self, message: impl Into<String>) -> ModelError {
        ModelError::BackendProcess {
            program: self.program_label(),
            message: message.into(),
        }
    }

    fn encode_matrix(matrix: ArrayView2<f64>) -> String {
        let header: Vec<&str> = Biomarker::CANONICAL.iter().map(|m| m.column_name()).collect();
        let mut text = header.join("\t");
        text.push('\n');
        for row in matrix.rows() {
            let fields: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            text.push_str(&fields.join("\t"));
            text.push('\n');
        }
        text
    }

    /// Maps the reader thread's answer, or the lack of one, to the call outcome.
    fn received_streams(
        &self,
        received: Result<std::io::Result<(String, String)>, RecvTimeoutError>,
    ) -> Result<(String, String), ModelError> {
        match received {
            Ok(Ok(streams)) => Ok(streams),
            Ok(Err(io_err)) => Err(self.process_error(format!("failed to read output: {io_err}"))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(self.process_error("output reader thread exited without a result"))
            }
            Err(RecvTimeoutError::Timeout) => {
                log::error!(
                    "External backend '{}' exceeded {:?}; killing it",
                    self.name,
                    self.timeout
                );
                Err(ModelError::BackendTimeout {
                    program: self.program_label(),
                    seconds: self.timeout.as_secs(),
                })
            }
        }
    }

    fn decode_output(&self, stdout: &str, expected_rows: usize) -> Result<Array2<f64>, ModelError> {
        let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.len() != expected_rows {
            return Err(self.process_error(format!(
                "expected {expected_rows} output lines, received {}",
                lines.len()
            )));
        }

        let mut output = Array2::zeros((expected_rows, self.output_width));
        for (row, line) in lines.iter().enumerate() {
            let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
            if fields.len() != self.output_width {
                return Err(self.process_error(format!(
                    "line {} has {} fields, expected {}",
                    row + 1,
                    fields.len(),
                    self.output_width
                )));
            }
            for (col, field) in fields.iter().enumerate() {
                // Unparseable text becomes NaN so the shared contract reports it.
                output[[row, col]] = field.parse::<f64>().unwrap_or(f64::NAN);
            }
        }
        Ok(output)
    }
}

impl ModelBackend for ExternalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_width(&self) -> usize {
        self.output_width
    }

    fn predict(&self, matrix: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
        log::info!(
            "Running external backend '{}' ({}) on {} records",
            self.name,
            self.program_label(),
            matrix.nrows()
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| self.process_error(format!("could not start: {err}")))?;

        let payload = Self::encode_matrix(matrix);
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.process_error("stdin was not captured"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.process_error("stdout was not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.process_error("stderr was not captured"))?;

        // Writing and reading happen off-thread so a child that never reads
        // its input cannot block us past the timeout. Stderr is drained on its
        // own thread: a child that fills the stderr pipe before closing stdout
        // would otherwise stall both sides.
        let writer = thread::spawn(move || stdin.write_all(payload.as_bytes()));
        let (sender, receiver) = bounded(1);
        thread::spawn(move || {
            let stderr_reader = thread::spawn(move || {
                let mut err = String::new();
                stderr.read_to_string(&mut err).map(|_| err)
            });
            let mut out = String::new();
            let result = stdout.read_to_string(&mut out).and_then(|_| match stderr_reader.join() {
                Ok(err) => err.map(|err| (out, err)),
                Err(_) => Err(std::io::Error::other("stderr reader thread panicked")),
            });
            // The receiver is gone if we already timed out.
            let _ = sender.send(result);
        });

        let (out, err) = match self.received_streams(receiver.recv_timeout(self.timeout)) {
            Ok(streams) => streams,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        let status = child.wait()?;
        match writer.join() {
            Ok(Ok(())) => {}
            // A child that exits without draining stdin is judged on its output.
            Ok(Err(io_err)) => log::debug!("External backend closed stdin early: {io_err}"),
            Err(_) => return Err(self.process_error("stdin writer thread panicked")),
        }

        if !status.success() {
            return Err(self.process_error(format!("exited with {status}: {}", err.trim())));
        }
        self.decode_output(&out, matrix.nrows())
    }
}
