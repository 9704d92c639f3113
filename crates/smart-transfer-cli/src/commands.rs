// SPDX-License-Identifier: AGPL-3.0
// Smart Transfer CLI - Console commands
//
// One command per input line. Results are printed as single-line JSON.

use serde::Serialize;
use smart_transfer_core::{CoreBridge, CoreError, VerificationState};
use std::fmt;

const DEFAULT_LOG_LIMIT: usize = 10;

pub const HELP: &str = "\
commands:
  devices [query]          list devices, optionally filtered by name or id
  status                   aggregate network status
  ping <device>            measure latency to a device
  reconnect <device>       force a device back online
  disconnect <device>      force a device offline
  enqueue <name> <bytes>   queue a file for transfer
  start <job> <device>     start uploading a queued job
  pause <job>              pause an uploading job
  resume <job>             resume a paused job
  cancel <job>             cancel a job
  transfers                list transfer jobs
  files [state] [query]    list file records by state (pending|verified|corrupted|all)
                           and name or id
  verify <file>            verify one file now
  verify-all               schedule verification of every pending file
  logs [limit]             recent verification log entries
  stats                    verification totals
  help                     show this help
  quit                     exit";

/// A parsed console line
#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    Devices { query: Option<String> },
    Status,
    Ping { device_id: String },
    Reconnect { device_id: String },
    Disconnect { device_id: String },
    Enqueue { file_name: String, size_bytes: u64 },
    Start { job_id: String, device_id: String },
    Pause { job_id: String },
    Resume { job_id: String },
    Cancel { job_id: String },
    Transfers,
    Files {
        filter: Option<VerificationState>,
        query: Option<String>,
    },
    Verify { file_id: String },
    VerifyAll,
    Logs { limit: usize },
    Stats,
    Help,
    Quit,
}

/// Why a line could not be turned into a command
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    Empty,
    UnknownCommand(String),
    MissingArgument(&'static str),
    InvalidArgument { name: &'static str, value: String },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty command"),
            Self::UnknownCommand(cmd) => write!(f, "unknown command '{}', try 'help'", cmd),
            Self::MissingArgument(name) => write!(f, "missing argument <{}>", name),
            Self::InvalidArgument { name, value } => {
                write!(f, "invalid <{}>: {}", name, value)
            }
        }
    }
}

impl CliCommand {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return Err(ParseError::Empty);
        };
        let mut args = Args { words };

        let parsed = match command.to_ascii_lowercase().as_str() {
            "devices" => Self::Devices { query: args.rest() },
            "status" => Self::Status,
            "ping" => Self::Ping {
                device_id: args.required("device")?,
            },
            "reconnect" => Self::Reconnect {
                device_id: args.required("device")?,
            },
            "disconnect" => Self::Disconnect {
                device_id: args.required("device")?,
            },
            "enqueue" => {
                let file_name = args.required("name")?;
                let bytes = args.required("bytes")?;
                let size_bytes = bytes.parse().map_err(|_| ParseError::InvalidArgument {
                    name: "bytes",
                    value: bytes.clone(),
                })?;
                Self::Enqueue {
                    file_name,
                    size_bytes,
                }
            }
            "start" => Self::Start {
                job_id: args.required("job")?,
                device_id: args.required("device")?,
            },
            "pause" => Self::Pause {
                job_id: args.required("job")?,
            },
            "resume" => Self::Resume {
                job_id: args.required("job")?,
            },
            "cancel" => Self::Cancel {
                job_id: args.required("job")?,
            },
            "transfers" => Self::Transfers,
            "files" => {
                let filter = match args.optional() {
                    Some(name) if name.eq_ignore_ascii_case("all") => None,
                    Some(name) => Some(VerificationState::from_name(&name).ok_or(
                        ParseError::InvalidArgument {
                            name: "state",
                            value: name,
                        },
                    )?),
                    None => None,
                };
                Self::Files {
                    filter,
                    query: args.rest(),
                }
            }
            "verify" => Self::Verify {
                file_id: args.required("file")?,
            },
            "verify-all" => Self::VerifyAll,
            "logs" => {
                let limit = match args.optional() {
                    Some(value) => value.parse().map_err(|_| ParseError::InvalidArgument {
                        name: "limit",
                        value: value.clone(),
                    })?,
                    None => DEFAULT_LOG_LIMIT,
                };
                Self::Logs { limit }
            }
            "stats" => Self::Stats,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(ParseError::UnknownCommand(other.to_string())),
        };

        Ok(parsed)
    }
}

/// Remaining words of a console line
struct Args<'a> {
    words: std::str::SplitWhitespace<'a>,
}

impl Args<'_> {
    fn optional(&mut self) -> Option<String> {
        self.words.next().map(str::to_string)
    }

    fn required(&mut self, name: &'static str) -> Result<String, ParseError> {
        self.optional().ok_or(ParseError::MissingArgument(name))
    }

    /// Everything left on the line, joined by single spaces
    fn rest(&mut self) -> Option<String> {
        let rest = self.words.by_ref().collect::<Vec<_>>().join(" ");
        (!rest.is_empty()).then_some(rest)
    }
}

/// Run a command against the core and render its result as JSON
pub async fn execute(bridge: &CoreBridge, command: CliCommand) -> Result<String, CoreError> {
    match command {
        CliCommand::Devices { query } => render(&bridge.list_devices(query).await?),
        CliCommand::Status => render(&bridge.get_aggregate_network_status().await?),
        CliCommand::Ping { device_id } => render(&bridge.ping_device(device_id).await?),
        CliCommand::Reconnect { device_id } => render(&bridge.reconnect_device(device_id).await?),
        CliCommand::Disconnect { device_id } => {
            render(&bridge.disconnect_device(device_id).await?)
        }
        CliCommand::Enqueue {
            file_name,
            size_bytes,
        } => render(&bridge.enqueue_transfer(file_name, size_bytes).await?),
        CliCommand::Start { job_id, device_id } => {
            render(&bridge.start_transfer(job_id, device_id).await?)
        }
        CliCommand::Pause { job_id } => render(&bridge.pause_transfer(job_id).await?),
        CliCommand::Resume { job_id } => render(&bridge.resume_transfer(job_id).await?),
        CliCommand::Cancel { job_id } => render(&bridge.cancel_transfer(job_id).await?),
        CliCommand::Transfers => render(&bridge.list_transfers().await?),
        CliCommand::Files { filter, query } => {
            render(&bridge.list_file_records(filter, query).await?)
        }
        CliCommand::Verify { file_id } => render(&bridge.verify_file(file_id).await?),
        CliCommand::VerifyAll => render(&bridge.verify_all_pending().await?),
        CliCommand::Logs { limit } => render(&bridge.list_recent_log_entries(limit).await?),
        CliCommand::Stats => render(&bridge.verification_stats().await?),
        CliCommand::Help => Ok(HELP.to_string()),
        CliCommand::Quit => {
            bridge.shutdown().await?;
            Ok("bye".to_string())
        }
    }
}

fn render<T: Serialize>(value: &T) -> Result<String, CoreError> {
    Ok(serde_json::to_string(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smart_transfer_core::{CoreService, CoreSettings};

    #[test]
    fn test_parse_commands() {
        assert_eq!(CliCommand::parse("status"), Ok(CliCommand::Status));
        assert_eq!(
            CliCommand::parse("  start job-1   D001 "),
            Ok(CliCommand::Start {
                job_id: "job-1".to_string(),
                device_id: "D001".to_string(),
            })
        );
        assert_eq!(
            CliCommand::parse("enqueue movie.mkv 10485760"),
            Ok(CliCommand::Enqueue {
                file_name: "movie.mkv".to_string(),
                size_bytes: 10_485_760,
            })
        );
        assert_eq!(
            CliCommand::parse("devices"),
            Ok(CliCommand::Devices { query: None })
        );
        assert_eq!(
            CliCommand::parse("files corrupted"),
            Ok(CliCommand::Files {
                filter: Some(VerificationState::Corrupted),
                query: None,
            })
        );
        assert_eq!(
            CliCommand::parse("logs"),
            Ok(CliCommand::Logs {
                limit: DEFAULT_LOG_LIMIT
            })
        );
        assert_eq!(CliCommand::parse("EXIT"), Ok(CliCommand::Quit));
    }

    #[test]
    fn test_parse_multi_word_queries() {
        assert_eq!(
            CliCommand::parse("devices Receiver   3"),
            Ok(CliCommand::Devices {
                query: Some("Receiver 3".to_string())
            })
        );
        assert_eq!(
            CliCommand::parse("files all report"),
            Ok(CliCommand::Files {
                filter: None,
                query: Some("report".to_string()),
            })
        );
        assert_eq!(
            CliCommand::parse("files Pending plan q3"),
            Ok(CliCommand::Files {
                filter: Some(VerificationState::Pending),
                query: Some("plan q3".to_string()),
            })
        );
        assert_eq!(
            CliCommand::parse("files"),
            Ok(CliCommand::Files {
                filter: None,
                query: None,
            })
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(CliCommand::parse("   "), Err(ParseError::Empty));
        assert_eq!(
            CliCommand::parse("ping"),
            Err(ParseError::MissingArgument("device"))
        );
        assert_eq!(
            CliCommand::parse("enqueue a.bin lots"),
            Err(ParseError::InvalidArgument {
                name: "bytes",
                value: "lots".to_string(),
            })
        );
        assert_eq!(
            CliCommand::parse("files broken"),
            Err(ParseError::InvalidArgument {
                name: "state",
                value: "broken".to_string(),
            })
        );
        assert!(matches!(
            CliCommand::parse("launch"),
            Err(ParseError::UnknownCommand(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_renders_json() {
        let settings = CoreSettings {
            rng_seed: Some(5),
            ..CoreSettings::default()
        };
        let bridge = CoreBridge::new(CoreService::new(settings).unwrap()).unwrap();

        let output = execute(&bridge, CliCommand::Status).await.unwrap();
        assert_eq!(output, "\"Unstable\"");

        let output = execute(
            &bridge,
            CliCommand::Reconnect {
                device_id: "D002".to_string(),
            },
        )
        .await
        .unwrap();
        let device: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(device["signalStrength"], 85);

        let err = execute(
            &bridge,
            CliCommand::Pause {
                job_id: "nope".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err, CoreError::UnknownJob("nope".to_string()));
    }
}
