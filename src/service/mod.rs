//! The compile-and-run service built on top of the server core.
//!
//! A `compile-execute` submission carries `<filename>\0<source bytes>`. The
//! service persists the source under the source directory with a timestamp
//! in the name, invokes the configured compiler, runs the produced
//! executable with captured streams, and answers with the combined output —
//! or with an `error-information` frame naming what went wrong.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{ForgewireError, Result};
use crate::process::{self, Outcome};
use crate::protocol::tags;
use crate::server::{Reply, TcpServer};

/// Directory and toolchain contract for the service.
///
/// The three directories are created at startup when missing; everything
/// else about the on-disk layout is an implementation detail.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Where submitted sources are persisted.
    pub source_dir: PathBuf,
    /// Where executables and capture files land.
    pub output_dir: PathBuf,
    /// Where the daemon writes its log.
    pub log_dir: PathBuf,
    /// Compiler command prefix, completed with `<source> -o <executable>`.
    pub compiler: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("src"),
            output_dir: PathBuf::from("out"),
            log_dir: PathBuf::from("cpl-log"),
            compiler: vec![
                "g++".to_string(),
                "-Wall".to_string(),
                "-Wextra".to_string(),
            ],
        }
    }
}

impl ServiceConfig {
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.source_dir)?;
        std::fs::create_dir_all(&self.output_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }
}

/// Install the Hello, compile-execute and default handlers on `server`.
pub fn register_service(server: &TcpServer, config: ServiceConfig) {
    let config = Arc::new(config);

    server.register_handler(
        tags::HELLO,
        Arc::new(|conn, _tag, payload| {
            let greeting = String::from_utf8_lossy(payload);
            tracing::info!(conn = %conn.name(), %greeting, "handshake");
            Some(Reply::new(
                tags::HELLO,
                format!("Hello from forgewire, {}!", conn.peer_addr()).into_bytes(),
            ))
        }),
    );

    server.register_handler(tags::COMPILE_EXECUTE, {
        let config = Arc::clone(&config);
        Arc::new(move |conn, _tag, payload| {
            match handle_submission(&config, payload) {
                Ok(reply) => Some(reply),
                Err(err) => {
                    tracing::warn!(conn = %conn.name(), error = %err, "submission rejected");
                    Some(Reply::new(
                        tags::ERROR_INFORMATION,
                        err.to_string().into_bytes(),
                    ))
                }
            }
        })
    });

    server.set_default_handler(Arc::new(|conn, tag, _payload| {
        tracing::warn!(conn = %conn.name(), %tag, "unknown command");
        Some(Reply::new(
            tags::ERROR_INFORMATION,
            format!("unknown command: {tag}").into_bytes(),
        ))
    }));
}

/// Persist, compile, run, combine. Infrastructure failures surface as
/// errors (and become `error-information` in the handler above); compile
/// and run failures are reported as structured replies here.
fn handle_submission(config: &ServiceConfig, payload: &[u8]) -> Result<Reply> {
    let (filename, source) = split_submission(payload)?;
    let (stem, ext) = split_name(filename);
    let stamp = process::epoch_millis();

    let src_path = process::fresh_path(&config.source_dir, &format!("{stem}-{stamp}{ext}"));
    std::fs::write(&src_path, source)?;
    tracing::info!(path = %src_path.display(), "submitted source persisted");

    let exe_path = process::fresh_path(&config.output_dir, &format!("{stem}-{stamp}.out"));
    let mut argv = config.compiler.clone();
    argv.push(src_path.display().to_string());
    argv.push("-o".to_string());
    argv.push(exe_path.display().to_string());

    let compile = process::run_capture(&argv)?;
    if !compile.outcome.success() {
        let errinfo_path = config
            .output_dir
            .join(format!("{stem}-{stamp}.errinfo"));
        std::fs::write(&errinfo_path, &compile.stderr)?;
        tracing::warn!(
            source = %src_path.display(),
            outcome = %compile.outcome,
            "compilation failed"
        );

        let mut message = format!("compilation failed ({}):\n", compile.outcome).into_bytes();
        message.extend_from_slice(&compile.stderr);
        return Ok(Reply::new(tags::ERROR_INFORMATION, message));
    }
    if !compile.stderr.is_empty() {
        tracing::debug!(
            source = %src_path.display(),
            warnings = %String::from_utf8_lossy(&compile.stderr),
            "compiler warnings"
        );
    }

    let run = process::run_redirected(
        &[exe_path.display().to_string()],
        None,
        &config.output_dir,
    )?;
    match run.outcome {
        Outcome::Exited(code) => {
            if code != 0 {
                tracing::debug!(executable = %exe_path.display(), code, "program exited non-zero");
            }
            let stdout = std::fs::read(&run.stdout_path)?;
            let stderr = std::fs::read(&run.stderr_path)?;

            let mut reply = Vec::with_capacity(filename.len() + 1 + 32 + stdout.len() + stderr.len());
            reply.extend_from_slice(filename.as_bytes());
            reply.push(0);
            reply.extend_from_slice(b"--- stdout ---\n");
            reply.extend_from_slice(&stdout);
            reply.extend_from_slice(b"\n--- stderr ---\n");
            reply.extend_from_slice(&stderr);
            Ok(Reply::new(tags::COMPILE_EXECUTE, reply))
        }
        outcome => {
            tracing::warn!(executable = %exe_path.display(), %outcome, "program did not exit normally");
            Ok(Reply::new(
                tags::ERROR_INFORMATION,
                format!("program {}", outcome).into_bytes(),
            ))
        }
    }
}

/// Split `<filename>\0<source>` and validate that the filename is a bare
/// basename.
fn split_submission(payload: &[u8]) -> Result<(&str, &[u8])> {
    let Some(nul) = payload.iter().position(|&b| b == 0) else {
        return Err(ForgewireError::Protocol(
            "missing NUL separator in submission".to_string(),
        ));
    };
    let filename = std::str::from_utf8(&payload[..nul])
        .map_err(|_| ForgewireError::Protocol("filename is not valid UTF-8".to_string()))?;
    if filename.is_empty() {
        return Err(ForgewireError::Protocol("empty filename".to_string()));
    }
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return Err(ForgewireError::Protocol(format!(
            "filename must be a bare basename: {filename:?}"
        )));
    }
    Ok((filename, &payload[nul + 1..]))
}

/// `"hi.cpp"` -> `("hi", ".cpp")`; extensionless and dot-leading names keep
/// everything in the stem.
fn split_name(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(pos) if pos > 0 => filename.split_at(pos),
        _ => (filename, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_split_submission() {
        let (name, source) = split_submission(b"hi.cpp\0int main(){}").unwrap();
        assert_eq!(name, "hi.cpp");
        assert_eq!(source, b"int main(){}");
    }

    #[test]
    fn test_split_submission_empty_source() {
        let (name, source) = split_submission(b"empty.cpp\0").unwrap();
        assert_eq!(name, "empty.cpp");
        assert!(source.is_empty());
    }

    #[test]
    fn test_split_submission_missing_nul() {
        assert!(split_submission(b"no separator here").is_err());
    }

    #[test]
    fn test_split_submission_rejects_paths() {
        assert!(split_submission(b"../evil.cpp\0x").is_err());
        assert!(split_submission(b"dir/evil.cpp\0x").is_err());
        assert!(split_submission(b"dir\\evil.cpp\0x").is_err());
        assert!(split_submission(b"\0x").is_err());
    }

    #[test]
    fn test_split_name() {
        assert_eq!(split_name("hi.cpp"), ("hi", ".cpp"));
        assert_eq!(split_name("archive.tar.gz"), ("archive.tar", ".gz"));
        assert_eq!(split_name("noext"), ("noext", ""));
        assert_eq!(split_name(".hidden"), (".hidden", ""));
    }

    #[test]
    fn test_submission_compiles_and_runs() {
        let dir = tempfile::tempdir().unwrap();
        let config = stub_config(dir.path());
        config.ensure_directories().unwrap();

        let source = b"#!/bin/sh\necho program output\necho diagnostics >&2\n";
        let mut payload = b"prog.sh\0".to_vec();
        payload.extend_from_slice(source);

        let reply = handle_submission(&config, &payload).unwrap();
        assert_eq!(reply.tag, tags::COMPILE_EXECUTE);

        let text = String::from_utf8_lossy(&reply.payload);
        assert!(text.starts_with("prog.sh\0--- stdout ---\n"));
        assert!(text.contains("program output"));
        assert!(text.contains("--- stderr ---"));
        assert!(text.contains("diagnostics"));

        // One persisted source, stamped and with its extension kept.
        let sources: Vec<_> = std::fs::read_dir(&config.source_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(sources.len(), 1);
        assert!(sources[0].starts_with("prog-"));
        assert!(sources[0].ends_with(".sh"));
    }

    #[test]
    fn test_failed_compile_reports_and_persists_errinfo() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = stub_config(dir.path());
        config.compiler = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo \"error: use of undeclared identifier 'x'\" >&2; exit 1".to_string(),
        ];
        config.ensure_directories().unwrap();

        let reply = handle_submission(&config, b"bad.cpp\0int main(){return x;}").unwrap();
        assert_eq!(reply.tag, tags::ERROR_INFORMATION);
        let text = String::from_utf8_lossy(&reply.payload);
        assert!(text.contains("compilation failed"));
        assert!(text.contains("undeclared identifier 'x'"));

        let errinfo: Vec<_> = std::fs::read_dir(&config.output_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.ends_with(".errinfo"))
            .collect();
        assert_eq!(errinfo.len(), 1);
        assert!(errinfo[0].starts_with("bad-"));
    }

    /// A stand-in compiler: copies the source to the output path and marks
    /// it executable, so shell-script "sources" become runnable programs.
    fn stub_config(base: &Path) -> ServiceConfig {
        let stub = base.join("stubcc.sh");
        std::fs::write(&stub, b"#!/bin/sh\n# usage: stubcc.sh <src> -o <out>\ncp \"$1\" \"$3\"\nchmod +x \"$3\"\n")
            .unwrap();

        ServiceConfig {
            source_dir: base.join("src"),
            output_dir: base.join("out"),
            log_dir: base.join("cpl-log"),
            compiler: vec!["sh".to_string(), stub.display().to_string()],
        }
    }
}
