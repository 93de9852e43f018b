//! Command Set
//!
//! Every supported command is a variant of [`Command`]. The `parse_*`
//! functions are the argument-parsing step referenced by the command table;
//! [`Command::execute`] runs a parsed command against the server state.
//!
//! Execution returns `Ok(Some(reply))` for the common single-reply case and
//! `Ok(None)` when the command already wrote its own output through the
//! session (multi-part pub/sub confirmations, raw file transfers).

use crate::commands::{CommandError, CommandSpec};
use crate::connection::{ReplicationRole, Session};
use crate::protocol::types::{bulk_header, CRLF};
use crate::protocol::RespValue;
use crate::server::ServerContext;
use crate::storage::SetCondition;
use bytes::Bytes;
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, info};

/// Number of entries `SLOWLOG GET` returns without an explicit count.
const SLOWLOG_DEFAULT_COUNT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowLogAction {
    Get(usize),
    Len,
    Reset,
}

/// A command with its arguments bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Auth {
        token: Bytes,
    },
    Ping {
        message: Option<Bytes>,
    },
    Echo {
        message: Bytes,
    },
    Quit,
    Get {
        key: Bytes,
    },
    Set {
        key: Bytes,
        value: Bytes,
        ttl: Option<Duration>,
        condition: SetCondition,
    },
    Del {
        keys: Vec<Bytes>,
    },
    Exists {
        keys: Vec<Bytes>,
    },
    /// INCR, DECR, INCRBY and DECRBY
    IncrBy {
        key: Bytes,
        delta: i64,
    },
    Append {
        key: Bytes,
        value: Bytes,
    },
    Strlen {
        key: Bytes,
    },
    MGet {
        keys: Vec<Bytes>,
    },
    MSet {
        pairs: Vec<(Bytes, Bytes)>,
    },
    Expire {
        key: Bytes,
        seconds: i64,
    },
    Ttl {
        key: Bytes,
    },
    Keys {
        pattern: Bytes,
    },
    DbSize,
    FlushDb,
    Subscribe {
        channels: Vec<Bytes>,
    },
    /// An empty channel list means every current subscription
    Unsubscribe {
        channels: Vec<Bytes>,
    },
    Publish {
        channel: Bytes,
        message: Bytes,
    },
    SlowLog(SlowLogAction),
    Info {
        section: Option<String>,
    },
    /// `None` stops replication (`SLAVEOF NO ONE`)
    SlaveOf {
        master: Option<(String, u16)>,
    },
    ReplConf,
    FetchFile {
        name: String,
    },
}

impl Command {
    /// Runs the argument-parsing step of `spec` over `tokens`.
    pub fn parse(spec: &CommandSpec, tokens: &[Bytes]) -> Result<Command, CommandError> {
        (spec.parse)(tokens)
    }

    /// Executes the command.
    pub fn execute(
        self,
        ctx: &ServerContext,
        session: &mut Session,
    ) -> Result<Option<RespValue>, CommandError> {
        let storage = &ctx.storage;

        let reply = match self {
            Command::Auth { token } => match ctx.config.namespace_for_token(&token) {
                Some(namespace) => {
                    session.authenticate(namespace);
                    debug!(session = session.id(), namespace, "Session authenticated");
                    RespValue::ok()
                }
                None if !ctx.config.auth_required() => {
                    RespValue::error("ERR Client sent AUTH, but no password is set")
                }
                None => RespValue::error("ERR invalid password"),
            },

            Command::Ping { message: None } => RespValue::pong(),
            Command::Ping {
                message: Some(message),
            } => RespValue::bulk_string(message),
            Command::Echo { message } => RespValue::bulk_string(message),

            Command::Quit => {
                session.set_close_after_reply();
                RespValue::ok()
            }

            Command::Get { key } => RespValue::from_optional(storage.get(&key)),

            Command::Set {
                key,
                value,
                ttl,
                condition,
            } => {
                if storage.set(key, value, ttl, condition) {
                    RespValue::ok()
                } else {
                    RespValue::null()
                }
            }

            Command::Del { keys } => RespValue::integer(storage.delete_many(&keys) as i64),
            Command::Exists { keys } => RespValue::integer(storage.exists_many(&keys) as i64),

            Command::IncrBy { key, delta } => RespValue::integer(storage.incr_by(&key, delta)?),

            Command::Append { key, value } => {
                RespValue::integer(storage.append(&key, &value) as i64)
            }
            Command::Strlen { key } => RespValue::integer(storage.strlen(&key) as i64),

            Command::MGet { keys } => RespValue::array(
                keys.iter()
                    .map(|key| RespValue::from_optional(storage.get(key)))
                    .collect(),
            ),
            Command::MSet { pairs } => {
                for (key, value) in pairs {
                    storage.set(key, value, None, SetCondition::Always);
                }
                RespValue::ok()
            }

            Command::Expire { key, seconds } if seconds <= 0 => {
                RespValue::integer(storage.delete_many(std::slice::from_ref(&key)) as i64)
            }
            Command::Expire { key, seconds } => {
                let applied = storage.expire(&key, Duration::from_secs(seconds as u64));
                RespValue::integer(applied as i64)
            }
            Command::Ttl { key } => RespValue::integer(storage.ttl(&key).unwrap_or(-2)),

            Command::Keys { pattern } => RespValue::bulk_array(storage.keys(&pattern)),
            Command::DbSize => RespValue::integer(storage.len() as i64),
            Command::FlushDb => {
                storage.flush();
                RespValue::ok()
            }

            Command::Subscribe { channels } => {
                for channel in channels {
                    session.subscribe(channel.clone());
                    let count = session.subscription_count() as i64;
                    session.reply(&subscription_reply("subscribe", Some(channel), count));
                }
                return Ok(None);
            }
            Command::Unsubscribe { channels } => {
                let channels = if channels.is_empty() {
                    session.subscriptions()
                } else {
                    channels
                };
                if channels.is_empty() {
                    session.reply(&subscription_reply("unsubscribe", None, 0));
                }
                for channel in channels {
                    session.unsubscribe(&channel);
                    let count = session.subscription_count() as i64;
                    session.reply(&subscription_reply("unsubscribe", Some(channel), count));
                }
                return Ok(None);
            }
            Command::Publish { channel, message } => {
                RespValue::integer(ctx.pubsub.publish(&channel, message) as i64)
            }

            Command::SlowLog(SlowLogAction::Get(count)) => ctx.slowlog.latest_resp(count),
            Command::SlowLog(SlowLogAction::Len) => RespValue::integer(ctx.slowlog.len() as i64),
            Command::SlowLog(SlowLogAction::Reset) => {
                ctx.slowlog.reset();
                RespValue::ok()
            }

            Command::Info { section } => {
                RespValue::bulk_string(Bytes::from(info(ctx, section.as_deref())))
            }

            Command::SlaveOf { master: None } => {
                if ctx.status.is_replica() {
                    info!("Replication stopped, acting as master");
                }
                ctx.status.promote();
                RespValue::ok()
            }
            Command::SlaveOf {
                master: Some((host, port)),
            } => {
                info!(master = %format!("{}:{}", host, port), "Following new master");
                ctx.status.replicate_from(host, port);
                RespValue::ok()
            }

            Command::ReplConf => {
                if session.role() != ReplicationRole::Replica {
                    info!(session = session.id(), client = %session.peer(), "Session became a replication link");
                }
                session.set_role(ReplicationRole::Replica);
                RespValue::ok()
            }

            Command::FetchFile { name } => {
                let path = ctx.config.dir.join(&name);
                let file = std::fs::File::open(&path)?;
                let len = file.metadata()?.len();
                debug!(session = session.id(), file = %path.display(), len, "Streaming file to replica");

                session.send_raw(bulk_header(len));
                session.send_file(file, len);
                session.send_raw(Bytes::from_static(CRLF));
                return Ok(None);
            }
        };

        Ok(Some(reply))
    }
}

fn subscription_reply(kind: &'static str, channel: Option<Bytes>, count: i64) -> RespValue {
    RespValue::array(vec![
        RespValue::bulk_string(Bytes::from_static(kind.as_bytes())),
        RespValue::from_optional(channel),
        RespValue::integer(count),
    ])
}

/// Renders the `INFO` report. `None`, `all` and `default` select every section.
fn info(ctx: &ServerContext, section: Option<&str>) -> String {
    let wants = |name: &str| match section {
        None | Some("all") | Some("default") => true,
        Some(s) => s == name,
    };

    let mut out = String::new();

    if wants("server") {
        let _ = write!(
            out,
            "# Server\r\n\
             sparkkv_version:{}\r\n\
             os:{}\r\n\
             process_id:{}\r\n\
             tcp_port:{}\r\n\
             uptime_in_seconds:{}\r\n\
             worker_threads:{}\r\n\
             \r\n",
            crate::VERSION,
            std::env::consts::OS,
            std::process::id(),
            ctx.config.port,
            ctx.uptime_secs(),
            ctx.config.workers,
        );
    }

    if wants("clients") {
        let _ = write!(
            out,
            "# Clients\r\n\
             connected_clients:{}\r\n\
             pubsub_channels:{}\r\n\
             \r\n",
            ctx.stats.active_connections.load(Ordering::Relaxed),
            ctx.pubsub.channel_count(),
        );
    }

    if wants("stats") {
        let storage = ctx.storage.stats();
        let _ = write!(
            out,
            "# Stats\r\n\
             total_connections_received:{}\r\n\
             total_commands_processed:{}\r\n\
             total_net_input_bytes:{}\r\n\
             total_net_output_bytes:{}\r\n\
             expired_keys:{}\r\n\
             slowlog_len:{}\r\n\
             loading:{}\r\n\
             \r\n",
            ctx.stats.connections_accepted.load(Ordering::Relaxed),
            ctx.stats.commands_processed.load(Ordering::Relaxed),
            ctx.stats.bytes_in.load(Ordering::Relaxed),
            ctx.stats.bytes_out.load(Ordering::Relaxed),
            storage.expired,
            ctx.slowlog.len(),
            ctx.status.is_loading() as u8,
        );
    }

    if wants("commandstats") {
        out.push_str("# Commandstats\r\n");
        for cmd in ctx.stats.command_stats() {
            let _ = write!(
                out,
                "cmdstat_{}:calls={},usec={},usec_per_call={:.2}\r\n",
                cmd.name,
                cmd.calls,
                cmd.usec,
                cmd.usec_per_call(),
            );
        }
        out.push_str("\r\n");
    }

    if wants("replication") {
        out.push_str("# Replication\r\n");
        match ctx.status.master() {
            Some((host, port)) => {
                let _ = write!(
                    out,
                    "role:slave\r\nmaster_host:{}\r\nmaster_port:{}\r\nslave_read_only:{}\r\n",
                    host, port, ctx.config.slave_readonly as u8,
                );
            }
            None => out.push_str("role:master\r\n"),
        }
        out.push_str("\r\n");
    }

    if wants("keyspace") {
        let storage = ctx.storage.stats();
        out.push_str("# Keyspace\r\n");
        if storage.keys > 0 {
            let _ = write!(out, "db0:keys={}\r\n", storage.keys);
        }
    }

    out
}

// ============================================================================
// Argument parsing
// ============================================================================

/// Largest expire time accepted, in milliseconds.
const MAX_EXPIRE_MILLIS: u64 = i64::MAX as u64;

fn parse_number<T: FromStr>(token: &[u8]) -> Result<T, CommandError> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(CommandError::not_integer)
}

fn parse_utf8(token: &[u8]) -> Result<String, CommandError> {
    std::str::from_utf8(token)
        .map(str::to_string)
        .map_err(|_| CommandError::syntax())
}

pub fn parse_auth(tokens: &[Bytes]) -> Result<Command, CommandError> {
    Ok(Command::Auth {
        token: tokens[1].clone(),
    })
}

pub fn parse_ping(tokens: &[Bytes]) -> Result<Command, CommandError> {
    match tokens.len() {
        1 => Ok(Command::Ping { message: None }),
        2 => Ok(Command::Ping {
            message: Some(tokens[1].clone()),
        }),
        _ => Err(CommandError::parse(
            "wrong number of arguments for 'ping' command",
        )),
    }
}

pub fn parse_echo(tokens: &[Bytes]) -> Result<Command, CommandError> {
    Ok(Command::Echo {
        message: tokens[1].clone(),
    })
}

pub fn parse_quit(_tokens: &[Bytes]) -> Result<Command, CommandError> {
    Ok(Command::Quit)
}

pub fn parse_get(tokens: &[Bytes]) -> Result<Command, CommandError> {
    Ok(Command::Get {
        key: tokens[1].clone(),
    })
}

/// SET key value [EX seconds | PX milliseconds] [NX | XX]
pub fn parse_set(tokens: &[Bytes]) -> Result<Command, CommandError> {
    let mut ttl = None;
    let mut condition = SetCondition::Always;

    let mut i = 3;
    while i < tokens.len() {
        let opt = &tokens[i];
        if opt.eq_ignore_ascii_case(b"ex") || opt.eq_ignore_ascii_case(b"px") {
            let amount = tokens.get(i + 1).ok_or_else(CommandError::syntax)?;
            if ttl.is_some() {
                return Err(CommandError::syntax());
            }
            let amount: u64 = parse_number(amount)?;
            let millis = if opt.eq_ignore_ascii_case(b"ex") {
                amount.checked_mul(1000)
            } else {
                Some(amount)
            };
            // Expiry times are kept in milliseconds that must fit an i64
            let millis = millis
                .filter(|&ms| ms > 0 && ms <= MAX_EXPIRE_MILLIS)
                .ok_or_else(|| CommandError::parse("invalid expire time in 'set' command"))?;
            ttl = Some(Duration::from_millis(millis));
            i += 2;
        } else if opt.eq_ignore_ascii_case(b"nx") || opt.eq_ignore_ascii_case(b"xx") {
            if condition != SetCondition::Always {
                return Err(CommandError::syntax());
            }
            condition = if opt.eq_ignore_ascii_case(b"nx") {
                SetCondition::IfAbsent
            } else {
                SetCondition::IfPresent
            };
            i += 1;
        } else {
            return Err(CommandError::syntax());
        }
    }

    Ok(Command::Set {
        key: tokens[1].clone(),
        value: tokens[2].clone(),
        ttl,
        condition,
    })
}

pub fn parse_del(tokens: &[Bytes]) -> Result<Command, CommandError> {
    Ok(Command::Del {
        keys: tokens[1..].to_vec(),
    })
}

pub fn parse_exists(tokens: &[Bytes]) -> Result<Command, CommandError> {
    Ok(Command::Exists {
        keys: tokens[1..].to_vec(),
    })
}

pub fn parse_incr(tokens: &[Bytes]) -> Result<Command, CommandError> {
    Ok(Command::IncrBy {
        key: tokens[1].clone(),
        delta: 1,
    })
}

pub fn parse_decr(tokens: &[Bytes]) -> Result<Command, CommandError> {
    Ok(Command::IncrBy {
        key: tokens[1].clone(),
        delta: -1,
    })
}

pub fn parse_incrby(tokens: &[Bytes]) -> Result<Command, CommandError> {
    Ok(Command::IncrBy {
        key: tokens[1].clone(),
        delta: parse_number(&tokens[2])?,
    })
}

pub fn parse_decrby(tokens: &[Bytes]) -> Result<Command, CommandError> {
    let delta: i64 = parse_number(&tokens[2])?;
    Ok(Command::IncrBy {
        key: tokens[1].clone(),
        delta: delta.checked_neg().ok_or_else(CommandError::not_integer)?,
    })
}

pub fn parse_append(tokens: &[Bytes]) -> Result<Command, CommandError> {
    Ok(Command::Append {
        key: tokens[1].clone(),
        value: tokens[2].clone(),
    })
}

pub fn parse_strlen(tokens: &[Bytes]) -> Result<Command, CommandError> {
    Ok(Command::Strlen {
        key: tokens[1].clone(),
    })
}

pub fn parse_mget(tokens: &[Bytes]) -> Result<Command, CommandError> {
    Ok(Command::MGet {
        keys: tokens[1..].to_vec(),
    })
}

pub fn parse_mset(tokens: &[Bytes]) -> Result<Command, CommandError> {
    let args = &tokens[1..];
    if args.len() % 2 != 0 {
        return Err(CommandError::parse("wrong number of arguments for MSET"));
    }
    Ok(Command::MSet {
        pairs: args
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect(),
    })
}

pub fn parse_expire(tokens: &[Bytes]) -> Result<Command, CommandError> {
    let seconds: i64 = parse_number(&tokens[2])?;
    if seconds.checked_mul(1000).is_none() {
        return Err(CommandError::parse("invalid expire time in 'expire' command"));
    }
    Ok(Command::Expire {
        key: tokens[1].clone(),
        seconds,
    })
}

pub fn parse_ttl(tokens: &[Bytes]) -> Result<Command, CommandError> {
    Ok(Command::Ttl {
        key: tokens[1].clone(),
    })
}

pub fn parse_keys(tokens: &[Bytes]) -> Result<Command, CommandError> {
    Ok(Command::Keys {
        pattern: tokens[1].clone(),
    })
}

pub fn parse_dbsize(_tokens: &[Bytes]) -> Result<Command, CommandError> {
    Ok(Command::DbSize)
}

pub fn parse_flushdb(_tokens: &[Bytes]) -> Result<Command, CommandError> {
    Ok(Command::FlushDb)
}

pub fn parse_subscribe(tokens: &[Bytes]) -> Result<Command, CommandError> {
    Ok(Command::Subscribe {
        channels: tokens[1..].to_vec(),
    })
}

pub fn parse_unsubscribe(tokens: &[Bytes]) -> Result<Command, CommandError> {
    Ok(Command::Unsubscribe {
        channels: tokens[1..].to_vec(),
    })
}

pub fn parse_publish(tokens: &[Bytes]) -> Result<Command, CommandError> {
    Ok(Command::Publish {
        channel: tokens[1].clone(),
        message: tokens[2].clone(),
    })
}

/// SLOWLOG GET [count] | LEN | RESET
pub fn parse_slowlog(tokens: &[Bytes]) -> Result<Command, CommandError> {
    let sub = &tokens[1];
    let action = if sub.eq_ignore_ascii_case(b"get") && tokens.len() <= 3 {
        let count = match tokens.get(2) {
            Some(count) => parse_number(count)?,
            None => SLOWLOG_DEFAULT_COUNT,
        };
        SlowLogAction::Get(count)
    } else if sub.eq_ignore_ascii_case(b"len") && tokens.len() == 2 {
        SlowLogAction::Len
    } else if sub.eq_ignore_ascii_case(b"reset") && tokens.len() == 2 {
        SlowLogAction::Reset
    } else {
        return Err(CommandError::parse(
            "SLOWLOG subcommand must be one of GET, LEN, RESET",
        ));
    };
    Ok(Command::SlowLog(action))
}

pub fn parse_info(tokens: &[Bytes]) -> Result<Command, CommandError> {
    let section = match tokens.len() {
        1 => None,
        2 => Some(parse_utf8(&tokens[1])?.to_ascii_lowercase()),
        _ => return Err(CommandError::syntax()),
    };
    Ok(Command::Info { section })
}

/// SLAVEOF host port | NO ONE
pub fn parse_slaveof(tokens: &[Bytes]) -> Result<Command, CommandError> {
    if tokens[1].eq_ignore_ascii_case(b"no") && tokens[2].eq_ignore_ascii_case(b"one") {
        return Ok(Command::SlaveOf { master: None });
    }
    let host = parse_utf8(&tokens[1])?;
    let port = parse_number(&tokens[2]).map_err(|_| CommandError::parse("port should be a number"))?;
    Ok(Command::SlaveOf {
        master: Some((host, port)),
    })
}

pub fn parse_replconf(_tokens: &[Bytes]) -> Result<Command, CommandError> {
    Ok(Command::ReplConf)
}

/// _FETCH_FILE name
///
/// The name must stay inside the configured data directory.
pub fn parse_fetch_file(tokens: &[Bytes]) -> Result<Command, CommandError> {
    let name = parse_utf8(&tokens[1])?;
    if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        return Err(CommandError::parse("invalid file name"));
    }
    Ok(Command::FetchFile { name })
}
