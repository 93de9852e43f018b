//! Batch Dispatcher
//!
//! Runs every command framed by one read event, in arrival order, and turns
//! each outcome into a reply on the session.
//!
//! ## Pipeline
//!
//! ```text
//! batch ──> loading? ──yes──> "replication in progress", batch dropped
//!              │
//!              no
//!              ▼
//!     for each command (stop once close-after-reply is set):
//!         auth ─> lookup ─> arity ─> parse ─> read-only ─> execute
//!           │       │         │        │          │           │
//!           └───────┴─────────┴────────┴──────────┴───────────┴──> reply
//! ```
//!
//! Validation failures reply inline and the batch moves on to the next
//! command. Only the loading gate aborts the whole batch.

use crate::commands::{Command, CommandError};
use crate::connection::{ReplicationRole, Session};
use crate::protocol::{CommandTokens, RespValue};
use crate::server::ServerContext;
use std::time::Instant;
use tracing::{debug, error, trace};

/// Executes batches against the shared server state.
#[derive(Debug, Clone, Copy)]
pub struct Dispatcher<'a> {
    ctx: &'a ServerContext,
}

impl<'a> Dispatcher<'a> {
    pub fn new(ctx: &'a ServerContext) -> Self {
        Self { ctx }
    }

    /// Takes the session's framed commands and executes them in order.
    ///
    /// The batch is removed from the session before anything runs, so an
    /// aborted batch is never replayed on the next event.
    pub fn run_batch(&self, session: &mut Session) {
        let batch = session.take_batch();
        if batch.is_empty() {
            return;
        }

        if self.ctx.status.is_loading() {
            debug!(
                session = session.id(),
                discarded = batch.len(),
                "Server is loading, batch rejected"
            );
            session.reply(&RespValue::error(CommandError::Loading.to_string()));
            return;
        }

        for tokens in batch {
            if session.flags().close_after_reply {
                break;
            }
            if tokens.is_empty() {
                continue;
            }

            match self.run_command(session, &tokens) {
                Ok(Some(reply)) => session.reply(&reply),
                Ok(None) => {}
                Err(err) => session.reply(&RespValue::error(err.to_string())),
            }
        }
    }

    fn run_command(
        &self,
        session: &mut Session,
        tokens: &CommandTokens,
    ) -> Result<Option<RespValue>, CommandError> {
        let name = &tokens[0];

        if !session.is_authenticated() && !name.eq_ignore_ascii_case(b"auth") {
            return Err(CommandError::AuthenticationRequired);
        }

        let spec = self
            .ctx
            .commands
            .lookup(name, session.role())
            .ok_or(CommandError::UnknownCommand)?;

        if !spec.accepts_arity(tokens.len()) {
            return Err(CommandError::WrongArity);
        }

        let command = Command::parse(spec, tokens)?;

        if spec.is_write() && self.is_read_only(session) {
            return Err(CommandError::ReadOnly);
        }

        session.set_last_command(spec.name);
        self.ctx.stats.incr_calls(spec.name);

        let start = Instant::now();
        let result = command.execute(self.ctx, session);
        let duration_us = start.elapsed().as_micros() as u64;

        self.ctx.slowlog.push_if_needed(tokens, duration_us);
        self.ctx.stats.record_latency(spec.name, duration_us);
        trace!(session = session.id(), command = spec.name, duration_us, "Command executed");

        if let Err(err) = &result {
            error!(
                session = session.id(),
                command = spec.name,
                error = %err,
                "Failed to execute command"
            );
        }
        result
    }

    /// Writes are refused on replication links and on a replica server
    /// when `slave_readonly` is set.
    fn is_read_only(&self, session: &Session) -> bool {
        self.ctx.config.slave_readonly
            && (session.role() == ReplicationRole::Replica || self.ctx.status.is_replica())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::StorageEngine;
    use bytes::Bytes;
    use std::sync::Arc;

    fn create_context(config: Config) -> Arc<ServerContext> {
        Arc::new(ServerContext::new(config, Arc::new(StorageEngine::new())))
    }

    fn create_session(ctx: &Arc<ServerContext>) -> Session {
        let (session, _mailbox) = Session::new(
            ctx.next_session_id(),
            "127.0.0.1:60000".parse().unwrap(),
            Arc::clone(ctx),
        );
        session
    }

    fn encode_command(args: &[&str]) -> Vec<u8> {
        let mut out = format!("*{}\r\n", args.len()).into_bytes();
        for arg in args {
            out.extend_from_slice(format!("${}\r\n{}\r\n", arg.len(), arg).as_bytes());
        }
        out
    }

    /// Feeds `commands` as one read and returns everything written back.
    fn roundtrip(ctx: &ServerContext, session: &mut Session, commands: &[&[&str]]) -> String {
        let input: Vec<u8> = commands.iter().flat_map(|c| encode_command(c)).collect();
        session.feed(&input).unwrap();
        Dispatcher::new(ctx).run_batch(session);
        String::from_utf8(session.take_output_bytes().to_vec()).unwrap()
    }

    #[test]
    fn test_pipeline_replies_in_order() {
        let ctx = create_context(Config::default());
        let mut session = create_session(&ctx);

        let out = roundtrip(
            &ctx,
            &mut session,
            &[&["SET", "k", "1"], &["INCR", "k"], &["GET", "k"], &["PING"]],
        );
        assert_eq!(out, "+OK\r\n:2\r\n$1\r\n2\r\n+PONG\r\n");
        assert_eq!(session.last_command(), Some("ping"));
    }

    #[test]
    fn test_unauthenticated_session_is_rejected() {
        let ctx = create_context(Config {
            requirepass: Some("secret".into()),
            ..Config::default()
        });
        let mut session = create_session(&ctx);

        session.feed(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n").unwrap();
        Dispatcher::new(&ctx).run_batch(&mut session);
        assert_eq!(
            &session.take_output_bytes()[..],
            b"-NOAUTH Authentication required.\r\n"
        );
        assert_eq!(ctx.stats.calls("get"), 0);
    }

    #[test]
    fn test_auth_gate_does_not_abort_batch() {
        let ctx = create_context(Config {
            requirepass: Some("secret".into()),
            ..Config::default()
        });
        let mut session = create_session(&ctx);

        let out = roundtrip(
            &ctx,
            &mut session,
            &[
                &["SET", "k", "v"],
                &["auth", "secret"],
                &["SET", "k", "v"],
            ],
        );
        assert_eq!(out, "-NOAUTH Authentication required.\r\n+OK\r\n+OK\r\n");
        assert_eq!(ctx.stats.calls("set"), 1);
    }

    #[test]
    fn test_unknown_command_and_arity() {
        let ctx = create_context(Config::default());
        let mut session = create_session(&ctx);

        let out = roundtrip(
            &ctx,
            &mut session,
            &[&["NOSUCH"], &["GET"], &["GET", "a", "b"], &["DEL"], &["PING"]],
        );
        assert_eq!(
            out,
            "-ERR unknown command\r\n\
             -ERR wrong number of arguments\r\n\
             -ERR wrong number of arguments\r\n\
             -ERR wrong number of arguments\r\n\
             +PONG\r\n"
        );
    }

    #[test]
    fn test_replica_only_command_unknown_to_clients() {
        let ctx = create_context(Config::default());
        let mut session = create_session(&ctx);

        let out = roundtrip(&ctx, &mut session, &[&["_fetch_file", "dump"]]);
        assert_eq!(out, "-ERR unknown command\r\n");
    }

    #[test]
    fn test_parse_error_replies_message() {
        let ctx = create_context(Config::default());
        let mut session = create_session(&ctx);

        let out = roundtrip(&ctx, &mut session, &[&["SET", "k", "v", "NX", "XX"]]);
        assert_eq!(out, "-ERR syntax error\r\n");
        assert_eq!(ctx.stats.calls("set"), 0);
    }

    #[test]
    fn test_read_only_replica_session() {
        let ctx = create_context(Config::default());
        let mut session = create_session(&ctx);
        session.set_role(ReplicationRole::Replica);

        let out = roundtrip(&ctx, &mut session, &[&["SET", "k", "v"], &["GET", "k"]]);
        assert_eq!(
            out,
            "-READONLY You can't write against a read only slave.\r\n$-1\r\n"
        );
        assert_eq!(ctx.storage.len(), 0);
        assert_eq!(ctx.stats.calls("set"), 0);
        assert_eq!(ctx.stats.calls("get"), 1);
    }

    #[test]
    fn test_read_only_replica_server() {
        let ctx = create_context(Config::default());
        ctx.status.replicate_from("10.0.0.1".into(), 6379);
        let mut session = create_session(&ctx);

        let out = roundtrip(&ctx, &mut session, &[&["DEL", "k"]]);
        assert_eq!(out, "-READONLY You can't write against a read only slave.\r\n");
    }

    #[test]
    fn test_writable_replica() {
        let ctx = create_context(Config {
            slave_readonly: false,
            ..Config::default()
        });
        let mut session = create_session(&ctx);
        session.set_role(ReplicationRole::Replica);

        let out = roundtrip(&ctx, &mut session, &[&["SET", "k", "v"]]);
        assert_eq!(out, "+OK\r\n");
    }

    #[test]
    fn test_loading_rejects_whole_batch_once() {
        let ctx = create_context(Config::default());
        ctx.status.set_loading(true);
        let mut session = create_session(&ctx);

        let out = roundtrip(
            &ctx,
            &mut session,
            &[&["SET", "a", "1"], &["SET", "b", "2"], &["GET", "a"]],
        );
        assert_eq!(out, "-replication in progress\r\n");
        assert_eq!(ctx.stats.commands_processed.load(std::sync::atomic::Ordering::Relaxed), 0);

        // The rejected batch must not run once loading finishes.
        ctx.status.set_loading(false);
        Dispatcher::new(&ctx).run_batch(&mut session);
        assert!(!session.has_pending_output());
        assert_eq!(ctx.storage.len(), 0);
    }

    #[test]
    fn test_huge_expire_times_are_rejected() {
        let ctx = create_context(Config::default());
        let mut session = create_session(&ctx);

        let out = roundtrip(
            &ctx,
            &mut session,
            &[
                &["SET", "k", "v"],
                &["EXPIRE", "k", "9223372036854775807"],
                &["SET", "k", "v", "EX", "18446744073709551615"],
                &["TTL", "k"],
            ],
        );
        assert_eq!(
            out,
            "+OK\r\n\
             -ERR invalid expire time in 'expire' command\r\n\
             -ERR invalid expire time in 'set' command\r\n\
             :-1\r\n"
        );
    }

    #[test]
    fn test_quit_stops_the_batch() {
        let ctx = create_context(Config::default());
        let mut session = create_session(&ctx);

        let out = roundtrip(&ctx, &mut session, &[&["QUIT"], &["SET", "k", "v"]]);
        assert_eq!(out, "+OK\r\n");
        assert!(session.flags().close_after_reply);
        assert_eq!(ctx.storage.len(), 0);
    }

    #[test]
    fn test_empty_commands_are_skipped() {
        let ctx = create_context(Config::default());
        let mut session = create_session(&ctx);

        session.feed(b"*0\r\n*1\r\n$4\r\nPING\r\n").unwrap();
        Dispatcher::new(&ctx).run_batch(&mut session);
        assert_eq!(&session.take_output_bytes()[..], b"+PONG\r\n");
    }

    #[test]
    fn test_execution_error_replies_and_continues() {
        let ctx = create_context(Config::default());
        let mut session = create_session(&ctx);

        let out = roundtrip(
            &ctx,
            &mut session,
            &[&["SET", "k", "abc"], &["INCR", "k"], &["GET", "k"]],
        );
        assert_eq!(
            out,
            "+OK\r\n-ERR value is not an integer or out of range\r\n$3\r\nabc\r\n"
        );
        assert_eq!(ctx.stats.calls("incr"), 1);
    }

    #[test]
    fn test_slowlog_and_latency_recorded() {
        let ctx = create_context(Config {
            slowlog_log_slower_than: 0,
            ..Config::default()
        });
        let mut session = create_session(&ctx);

        roundtrip(&ctx, &mut session, &[&["SET", "k", "v"], &["GET", "k"]]);
        assert_eq!(ctx.slowlog.len(), 2);
        let latest = ctx.slowlog.latest(1);
        assert_eq!(latest[0].args, vec![Bytes::from("GET"), Bytes::from("k")]);

        let stats = ctx.stats.command_stats();
        assert_eq!(stats.iter().map(|s| s.calls).sum::<u64>(), 2);
        assert!(stats
            .iter()
            .all(|s| s.histogram.iter().sum::<u64>() == 1));
    }

    #[test]
    fn test_case_insensitive_names() {
        let ctx = create_context(Config::default());
        let mut session = create_session(&ctx);

        let out = roundtrip(&ctx, &mut session, &[&["pInG"], &["Echo", "x"]]);
        assert_eq!(out, "+PONG\r\n$1\r\nx\r\n");
    }
}
