//! Loopback companion - reference implementation of the entry contract.
//!
//! A companion process reads one request per line from stdin and writes one
//! response per line to stdout; stderr is diagnostics only. This binary
//! implements that contract with a handful of canned functions, and is what
//! the integration tests spawn:
//!
//! - `echo`        returns its first argument
//! - `answer`      returns the integer 456
//! - `fail`        reports an error with a stack trace
//! - `grumble`     writes to stderr, then reports an error
//! - `slow`        sleeps for `args[0]` milliseconds before responding
//! - `die`         exits without responding
//! - `die_loud`    writes to stderr, then exits without responding
//!
//! With `--linger` the process stays alive after stdin closes, like a
//! companion holding a live timer or event-loop registration - the case
//! the bridge's kill-then-wait teardown exists for.

use std::io::{self, BufRead, Write};
use std::time::Duration;

use serde_json::{json, Value};
use sidecall::codec::{decode_request, encode_fault, encode_result, RemoteFault, Request};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let linger = std::env::args().any(|arg| arg == "--linger");

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = match decode_request(&line) {
            Ok(request) => handle(request)?,
            Err(e) => encode_fault(
                0,
                &RemoteFault {
                    message: format!("bad request: {e}"),
                    stack: None,
                },
            )?,
        };
        write_line(&reply)?;
    }

    if linger {
        // stdin closing is not an exit signal for this companion.
        loop {
            std::thread::sleep(Duration::from_secs(60));
        }
    }
    Ok(())
}

fn handle(request: Request) -> sidecall::Result<String> {
    let Request { id, path, args } = request;
    match path.as_str() {
        "echo" => encode_result(id, args.first().unwrap_or(&Value::Null)),
        "answer" => encode_result(id, &json!(456)),
        "fail" => encode_fault(
            id,
            &RemoteFault {
                message: "synthetic failure".to_string(),
                stack: Some("at fail (loopback:1:1)".to_string()),
            },
        ),
        "grumble" => {
            eprintln!("grumble: something looks off");
            encode_fault(
                id,
                &RemoteFault {
                    message: "grumbled".to_string(),
                    stack: None,
                },
            )
        }
        "slow" => {
            let millis = args.first().and_then(Value::as_u64).unwrap_or(60_000);
            std::thread::sleep(Duration::from_millis(millis));
            encode_result(id, &json!("done"))
        }
        "die" => std::process::exit(0),
        "die_loud" => {
            eprintln!("fatal: companion giving up");
            std::process::exit(1);
        }
        _ => encode_fault(
            id,
            &RemoteFault {
                message: format!("no such function: {path}"),
                stack: None,
            },
        ),
    }
}

/// Write one response line: explicit `\n`, immediate flush. The host waits
/// for the complete line, so buffering a partial write would deadlock.
fn write_line(line: &str) -> io::Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    handle.write_all(line.as_bytes())?;
    handle.write_all(b"\n")?;
    handle.flush()
}
