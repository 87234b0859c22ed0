//! A simple program demonstrates how to use `relay` as a library.
//!
//! The model is played from a JSON script (`RELAY_SCRIPT`), so the whole
//! loop can be tried without any network access. An optional JSON config
//! can be given with `RELAY_CONFIG`. Logs are filtered by `RUST_LOG` and
//! printed as JSON when `RELAY_LOG_FORMAT=json`.

#[macro_use]
extern crate tracing;

use std::env;
use std::io::Write as _;

use futures_util::StreamExt;
use owo_colors::OwoColorize;
use relay::config::{RelayConfig, load_config, load_script};
use relay::core::StreamEvent;
use relay::{Session, SessionBuilder};
use relay_test_model::TestModelProvider;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, Lines};
use tracing_subscriber::EnvFilter;

const BAR_CHAR: &str = "▎";

#[tokio::main(flavor = "current_thread")]
async fn main() {
    setup_logging();

    let Ok(script_path) = env::var("RELAY_SCRIPT") else {
        eprintln!("RELAY_SCRIPT environment variable is not set");
        return;
    };
    let script = match load_script(&script_path) {
        Ok(script) => script,
        Err(err) => {
            eprintln!("{err}");
            return;
        }
    };
    let config = match env::var("RELAY_CONFIG") {
        Ok(path) => match load_config(&path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{err}");
                return;
            }
        },
        Err(_) => RelayConfig::default(),
    };
    let system_prompt = config.agent.system_prompt.clone().unwrap_or_else(|| {
        include_str!("./system_prompt.md").replace("{{HOST_OS}}", host_os())
    });

    let model_provider = TestModelProvider::with_script(script);
    let mut session = SessionBuilder::with_model_provider(model_provider)
        .with_config(config)
        .with_system_prompt(system_prompt)
        .build();
    if let Err(err) = session.start().await {
        eprintln!("{err}");
        return;
    }

    let mut lines = io::BufReader::new(io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let Some(line) = read_line(&mut lines).await else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/reset" {
            session.reset();
            continue;
        }
        answer(&mut session, line).await;
    }

    session.close().await;
}

async fn answer(session: &mut Session, line: &str) {
    let mut stream = session.send_message(line);
    let mut streaming_text = false;
    while let Some(event) = stream.next().await {
        match event {
            Ok(StreamEvent::TextDelta(delta)) => {
                if !streaming_text {
                    print!("{}🤖 ", BAR_CHAR.bright_cyan());
                    streaming_text = true;
                }
                print!("{}", delta.bright_white());
                std::io::stdout().flush().ok();
            }
            Ok(StreamEvent::ToolResult {
                tool_name,
                invocation_id,
                success,
            }) => {
                if streaming_text {
                    println!();
                    streaming_text = false;
                }
                let bar = BAR_CHAR.bright_yellow();
                if success {
                    println!("{bar}🔧 {tool_name} ({invocation_id}) done");
                } else {
                    println!("{bar}🔧 {tool_name} ({invocation_id}) failed");
                }
            }
            Ok(StreamEvent::Finished(_)) => {
                println!();
            }
            Err(err) => {
                if streaming_text {
                    println!();
                }
                println!("{}❌ {}", BAR_CHAR.bright_red(), err.bright_red());
            }
        }
    }
}

async fn read_line<R: AsyncBufRead + Unpin>(
    lines: &mut Lines<R>,
) -> Option<String> {
    match lines.next_line().await {
        Ok(line) => line,
        Err(err) => {
            error!("error reading input: {}", err);
            None
        }
    }
}

#[derive(Debug, PartialEq)]
enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn from_env_value(value: Option<&str>) -> Self {
        match value {
            Some(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

fn setup_logging() {
    let format = env::var("RELAY_LOG_FORMAT").ok();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr);
    match LogFormat::from_env_value(format.as_deref()) {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[inline]
fn host_os() -> &'static str {
    let os = std::env::consts::OS;
    match os {
        "linux" => "Linux",
        "macos" => "macOS",
        "windows" => "Windows",
        _ => "some other OS",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_line_keeps_buffered_input() {
        let input: &[u8] = b"first\nsecond\n\nthird";
        let mut lines = input.lines();
        assert_eq!(read_line(&mut lines).await.as_deref(), Some("first"));
        assert_eq!(read_line(&mut lines).await.as_deref(), Some("second"));
        assert_eq!(read_line(&mut lines).await.as_deref(), Some(""));
        assert_eq!(read_line(&mut lines).await.as_deref(), Some("third"));
        assert_eq!(read_line(&mut lines).await, None);
    }

    #[test]
    fn test_log_format() {
        assert_eq!(LogFormat::from_env_value(None), LogFormat::Text);
        assert_eq!(LogFormat::from_env_value(Some("text")), LogFormat::Text);
        assert_eq!(LogFormat::from_env_value(Some("JSON")), LogFormat::Json);
    }
}
