use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use drivedeck_core::config::{DEFAULT_CHUNK_BYTES, DEFAULT_MAX_FILE_BYTES};
use drivedeck_core::logging::{LogFormat, init_logging_with_default};
use drivedeck_core::progress::{NoopProgressSink, ProgressSink};
use drivedeck_core::{BatchOutcome, RelayClient, UploadLimits, UploadQueue, UploadTask};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

mod display;

use display::{HumanProgressSink, NdjsonProgressSink, RecordingSink};

#[derive(Parser)]
#[command(name = "drivedeck")]
#[command(about = "Upload to Google Drive through a drivedeckd relay", long_about = None)]
struct Cli {
    #[arg(long, env = "DRIVEDECK_RELAY_URL", default_value = "http://127.0.0.1:3000")]
    relay_url: String,

    #[arg(long)]
    json: bool,

    #[arg(long)]
    events: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Chunked resumable upload of one or more files, one at a time.
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(long, default_value_t = DEFAULT_CHUNK_BYTES)]
        chunk_bytes: u64,
        #[arg(long, default_value_t = DEFAULT_MAX_FILE_BYTES)]
        max_file_bytes: u64,
    },
    Ls,
    Mkdir {
        name: String,
    },
    Trash {
        id: String,
    },
    Duplicate {
        id: String,
    },
    /// Single-request upload for small files.
    Put {
        path: PathBuf,
        #[arg(long)]
        mime_type: Option<String>,
    },
    /// Download (stream) a file, optionally a byte range like `0-1023` or `512-`.
    Get {
        id: String,
        #[arg(long, short)]
        output: PathBuf,
        #[arg(long)]
        range: Option<String>,
    },
}

#[derive(Debug, Serialize)]
struct CliError {
    code: String,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging_with_default(LogFormat::from_env_or(LogFormat::Text), "warn");
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            if e.code == "task.cancelled" { 130 } else { 1 }
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let client = RelayClient::new(cli.relay_url.clone());

    match cli.cmd {
        Command::Upload {
            paths,
            chunk_bytes,
            max_file_bytes,
        } => {
            let limits = UploadLimits {
                chunk_bytes,
                max_file_bytes,
            };
            upload(client, limits, paths, cli.json, cli.events).await
        }
        Command::Ls => ls(&client, cli.json).await,
        Command::Mkdir { name } => {
            let res = client.create_folder(&name).await.map_err(map_core_err)?;
            print_result(cli.json, &res, || {
                format!("folderId={} name={}", res.folder_id, res.name)
            })
        }
        Command::Trash { id } => {
            client.trash(&id).await.map_err(map_core_err)?;
            print_result(cli.json, &serde_json::json!({ "success": true }), || {
                format!("trashed {id}")
            })
        }
        Command::Duplicate { id } => {
            let res = client.duplicate(&id).await.map_err(map_core_err)?;
            print_result(cli.json, &res, || {
                format!("fileId={} name={}", res.file_id, res.name)
            })
        }
        Command::Put { path, mime_type } => put(&client, &path, mime_type, cli.json).await,
        Command::Get { id, output, range } => {
            get(&client, &id, &output, range.as_deref(), cli.json).await
        }
    }
}

fn print_result<T: Serialize>(
    json: bool,
    value: &T,
    human: impl FnOnce() -> String,
) -> Result<(), CliError> {
    if json {
        println!(
            "{}",
            serde_json::to_string(value).map_err(|e| CliError::new("json.invalid", e.to_string()))?
        );
    } else {
        println!("{}", human());
    }
    Ok(())
}

fn guess_mime(path: &Path) -> Option<String> {
    mime_guess::from_path(path)
        .first()
        .map(|m| m.essence_str().to_string())
}

async fn upload(
    client: RelayClient,
    limits: UploadLimits,
    paths: Vec<PathBuf>,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    limits.validate().map_err(map_core_err)?;

    let mut tasks = Vec::with_capacity(paths.len());
    for path in &paths {
        let task = UploadTask::from_path(path, guess_mime(path))
            .await
            .map_err(|e| map_core_err(e).with_details(serde_json::json!({ "path": path })))?;
        tasks.push(task);
    }

    let client = Arc::new(client);
    let human = (!events && !json).then(|| Arc::new(HumanProgressSink::new()));
    let display: Arc<dyn ProgressSink> = match &human {
        Some(human) => human.clone(),
        None if events => Arc::new(NdjsonProgressSink),
        None => Arc::new(NoopProgressSink),
    };
    let recorder = Arc::new(RecordingSink::new(display));
    let queue = UploadQueue::new(client.clone(), limits, client.clone(), recorder.clone());

    let report = queue.enqueue(tasks);
    for skipped in &report.skipped {
        if events {
            println!(
                "{}",
                serde_json::json!({
                    "type": "task.state",
                    "kind": "file",
                    "state": "skipped",
                    "file": skipped.name,
                    "sizeBytes": skipped.size_bytes,
                    "reason": skipped.reason,
                })
            );
        } else {
            eprintln!("skipped {}: {}", skipped.name, skipped.reason);
        }
    }
    if report.accepted.is_empty() {
        return Err(CliError::new("request.invalid", "no files to upload")
            .with_details(serde_json::to_value(&report.skipped).unwrap_or_default()));
    }

    let ticker = human.map(|human| {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                human.tick(tokio::time::Instant::now());
            }
        })
    });

    tokio::select! {
        _ = queue.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(event = "upload.cancel_requested", "upload.cancel_requested");
            queue.cancel();
            queue.wait_idle().await;
        }
    }
    if let Some(ticker) = ticker {
        ticker.abort();
    }

    let (outcome, finished) = (recorder.outcome(), recorder.finished());

    match outcome {
        Some(BatchOutcome::Succeeded { completed }) => {
            if events {
                return Ok(());
            }
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "completed": completed,
                        "files": finished,
                        "skipped": report.skipped,
                    })
                );
            } else {
                println!("uploaded {completed} file(s)");
            }
            Ok(())
        }
        Some(BatchOutcome::Cancelled {
            completed,
            abandoned,
        }) => Err(CliError::new(
            "task.cancelled",
            format!("upload cancelled ({completed} completed, {abandoned} not started)"),
        )
        .with_details(serde_json::json!({ "completed": completed, "abandoned": abandoned }))),
        Some(BatchOutcome::Failed {
            completed,
            abandoned,
            file_name,
            code,
            message,
        }) => Err(CliError {
            retryable: code == "upload.chunk_failed" || code == "upload.session_failed",
            code,
            message,
            details: serde_json::json!({
                "file": file_name,
                "completed": completed,
                "abandoned": abandoned,
            }),
        }),
        None => Err(CliError::new("unknown", "upload run ended without an outcome")),
    }
}

async fn ls(client: &RelayClient, json: bool) -> Result<(), CliError> {
    let files = client.list_files().await.map_err(map_core_err)?;
    if json {
        println!("{}", serde_json::json!({ "files": files }));
        return Ok(());
    }
    for f in files {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            f.id, f.name, f.size, f.modified, f.owner
        );
    }
    Ok(())
}

async fn put(
    client: &RelayClient,
    path: &Path,
    mime_type: Option<String>,
    json: bool,
) -> Result<(), CliError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CliError::new("request.invalid", "path has no file name"))?
        .to_string();
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| CliError::new("io.failed", e.to_string()))?;
    let mime_type = mime_type
        .or_else(|| guess_mime(path))
        .unwrap_or_else(|| drivedeck_core::api::DEFAULT_MIME_TYPE.to_string());

    let res = client
        .upload_small(&name, &mime_type, bytes)
        .await
        .map_err(map_core_err)?;
    print_result(json, &res, || format!("fileId={}", res.file_id))
}

/// `a-b` (inclusive) or `a-`.
fn parse_range_arg(value: &str) -> Result<(u64, Option<u64>), CliError> {
    let invalid = || CliError::new("request.invalid", format!("invalid range: {value:?}"));
    let (start, end) = value.split_once('-').ok_or_else(invalid)?;
    let start = start.trim().parse::<u64>().map_err(|_| invalid())?;
    let end = match end.trim() {
        "" => None,
        e => Some(e.parse::<u64>().map_err(|_| invalid())?),
    };
    if matches!(end, Some(end) if end < start) {
        return Err(invalid());
    }
    Ok((start, end))
}

async fn get(
    client: &RelayClient,
    id: &str,
    output: &Path,
    range: Option<&str>,
    json: bool,
) -> Result<(), CliError> {
    let range = range.map(parse_range_arg).transpose()?;
    let res = client.open_stream(id, range).await.map_err(map_core_err)?;
    let status = res.status().as_u16();
    let content_range = res
        .headers()
        .get("content-range")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut file = tokio::fs::File::create(output)
        .await
        .map_err(|e| CliError::new("io.failed", e.to_string()))?;
    let mut written = 0u64;
    let mut stream = res.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| CliError::new("http.failed", e.to_string()))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| CliError::new("io.failed", e.to_string()))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|e| CliError::new("io.failed", e.to_string()))?;

    let summary = serde_json::json!({
        "status": status,
        "bytesWritten": written,
        "contentRange": content_range,
        "output": output,
    });
    print_result(json, &summary, || {
        format!("wrote {written} bytes to {}", output.display())
    })
}

fn map_core_err(e: drivedeck_core::Error) -> CliError {
    CliError {
        code: e.code().to_string(),
        retryable: e.is_retryable(),
        message: e.to_string(),
        details: serde_json::json!({}),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_argument() {
        assert_eq!(parse_range_arg("0-1023").unwrap(), (0, Some(1023)));
        assert_eq!(parse_range_arg("512-").unwrap(), (512, None));
        assert!(parse_range_arg("10-2").is_err());
        assert!(parse_range_arg("abc").is_err());
        assert!(parse_range_arg("-5").is_err());
    }

    #[test]
    fn core_errors_keep_their_codes() {
        let e = map_core_err(drivedeck_core::Error::configuration(
            "Server credentials not configured",
        ));
        assert_eq!(e.code, "config.invalid");
        assert!(!e.retryable);

        let e = map_core_err(drivedeck_core::Error::session("No upload URL returned"));
        assert_eq!(e.code, "upload.session_failed");
        assert!(e.retryable);
    }

    #[test]
    fn mime_is_guessed_from_extension() {
        assert_eq!(guess_mime(Path::new("a.txt")).as_deref(), Some("text/plain"));
        assert_eq!(guess_mime(Path::new("noext")), None);
    }

    #[test]
    fn cli_parses_upload_flags() {
        let cli = Cli::try_parse_from([
            "drivedeck",
            "--relay-url",
            "http://relay:3000",
            "--events",
            "upload",
            "--chunk-bytes",
            "524288",
            "a.bin",
            "b.bin",
        ])
        .unwrap();
        assert!(cli.events);
        assert_eq!(cli.relay_url, "http://relay:3000");
        match cli.cmd {
            Command::Upload {
                paths,
                chunk_bytes,
                max_file_bytes,
            } => {
                assert_eq!(paths.len(), 2);
                assert_eq!(chunk_bytes, 524_288);
                assert_eq!(max_file_bytes, DEFAULT_MAX_FILE_BYTES);
            }
            _ => panic!("expected upload"),
        }
    }
}
