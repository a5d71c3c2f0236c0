pub mod client;
pub mod config;
pub mod errors;
pub mod exec;
pub mod locks;
pub mod pargv;
pub mod parser;
pub mod path;
pub mod server;
pub mod session;
pub mod wire;

pub use client::{
    ClientSession, ClientState, CommandResult, CompletionReply, ExecEvent, HelpReply, StdinWriter,
};
pub use config::{ClientConfig, DaemonConfig, DEFAULT_SOCKET_PATH};
pub use errors::{ExecError, ParseFailure, ProtocolError, SessionError};
pub use exec::{
    CancelFlag, ExecContext, ExecIo, ExecOutcome, ExecPlan, Executor, CANCELLED_RETCODE,
};
pub use locks::LockRegistry;
pub use pargv::{Parg, Pargv, ParseStatus, Purpose};
pub use parser::{parse_line, split_argv, split_pipes, AcceptAll, ParseRequest, TokenValidator};
pub use path::{Level, Path};
pub use server::Daemon;
pub use session::{
    CompletionSet, IsattyFlags, PeerIdentity, Session, TermGeometry, STARTING_ENTRY,
};
pub use wire::{read_frame, tags, write_frame, Frame, Opcode, MAX_PAYLOAD};
