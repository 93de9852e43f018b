//! Command Table
//!
//! Maps a lower-cased command name to its [`CommandSpec`]: declared arity,
//! classification flags, and the argument parser that turns the raw tokens
//! into a [`Command`]. Lookup happens once per command.

use crate::commands::handler::{self, Command};
use crate::commands::CommandError;
use crate::connection::ReplicationRole;
use bytes::Bytes;
use std::collections::HashMap;

/// Argument parser: receives every token, command name included.
pub type ParseFn = fn(&[Bytes]) -> Result<Command, CommandError>;

/// Classification of a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandFlags {
    /// Mutates the keyspace; refused on read-only replicas
    pub write: bool,
    /// Only visible to sessions acting as replication links
    pub replica_only: bool,
}

impl CommandFlags {
    pub const READ: CommandFlags = CommandFlags {
        write: false,
        replica_only: false,
    };
    pub const WRITE: CommandFlags = CommandFlags {
        write: true,
        replica_only: false,
    };
    pub const REPLICA_ONLY: CommandFlags = CommandFlags {
        write: false,
        replica_only: true,
    };
}

#[derive(Clone)]
pub struct CommandSpec {
    /// Canonical lower-case name
    pub name: &'static str,
    /// Positive: exact token count. Negative: at least `-arity` tokens.
    /// The command name counts as a token.
    pub arity: i32,
    pub flags: CommandFlags,
    pub parse: ParseFn,
}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSpec")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("flags", &self.flags)
            .finish()
    }
}

impl CommandSpec {
    /// Checks `argc` tokens against the declared arity.
    pub fn accepts_arity(&self, argc: usize) -> bool {
        let argc = argc as i64;
        let arity = self.arity as i64;
        if arity >= 0 {
            argc == arity
        } else {
            argc >= -arity
        }
    }

    pub fn is_write(&self) -> bool {
        self.flags.write
    }
}

#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: HashMap<&'static str, CommandSpec>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the registry with every built-in command.
    pub fn with_builtin_commands() -> Self {
        use CommandFlags as F;

        let mut registry = Self::new();
        let table: &[(&'static str, i32, CommandFlags, ParseFn)] = &[
            // Connection
            ("auth", 2, F::READ, handler::parse_auth),
            ("ping", -1, F::READ, handler::parse_ping),
            ("echo", 2, F::READ, handler::parse_echo),
            ("quit", 1, F::READ, handler::parse_quit),
            // Strings and keys
            ("get", 2, F::READ, handler::parse_get),
            ("set", -3, F::WRITE, handler::parse_set),
            ("del", -2, F::WRITE, handler::parse_del),
            ("exists", -2, F::READ, handler::parse_exists),
            ("incr", 2, F::WRITE, handler::parse_incr),
            ("decr", 2, F::WRITE, handler::parse_decr),
            ("incrby", 3, F::WRITE, handler::parse_incrby),
            ("decrby", 3, F::WRITE, handler::parse_decrby),
            ("append", 3, F::WRITE, handler::parse_append),
            ("strlen", 2, F::READ, handler::parse_strlen),
            ("mget", -2, F::READ, handler::parse_mget),
            ("mset", -3, F::WRITE, handler::parse_mset),
            ("expire", 3, F::WRITE, handler::parse_expire),
            ("ttl", 2, F::READ, handler::parse_ttl),
            ("keys", 2, F::READ, handler::parse_keys),
            ("dbsize", 1, F::READ, handler::parse_dbsize),
            ("flushdb", 1, F::WRITE, handler::parse_flushdb),
            // Pub/Sub
            ("subscribe", -2, F::READ, handler::parse_subscribe),
            ("unsubscribe", -1, F::READ, handler::parse_unsubscribe),
            ("publish", 3, F::READ, handler::parse_publish),
            // Server
            ("slowlog", -2, F::READ, handler::parse_slowlog),
            ("info", -1, F::READ, handler::parse_info),
            ("slaveof", 3, F::READ, handler::parse_slaveof),
            ("replconf", -1, F::READ, handler::parse_replconf),
            // Replication links
            ("_fetch_file", 2, F::REPLICA_ONLY, handler::parse_fetch_file),
        ];

        for &(name, arity, flags, parse) in table {
            registry.register(CommandSpec {
                name,
                arity,
                flags,
                parse,
            });
        }
        registry
    }

    pub fn register(&mut self, spec: CommandSpec) {
        self.commands.insert(spec.name, spec);
    }

    /// Resolves `name` case-insensitively in the table visible to `role`.
    pub fn lookup(&self, name: &[u8], role: ReplicationRole) -> Option<&CommandSpec> {
        let name = std::str::from_utf8(name).ok()?.to_ascii_lowercase();
        self.commands
            .get(name.as_str())
            .filter(|spec| !spec.flags.replica_only || role == ReplicationRole::Replica)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
