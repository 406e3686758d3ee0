//! Method names understood by `lodge-worker`.
//!
//! The supervisor treats these as opaque strings and forwards any method it
//! does not handle itself.

pub const PING: &str = "ping";

pub const EXECUTE_COMMAND: &str = "execute_command";

pub const WRITE_TERMINAL: &str = "write_terminal";
pub const READ_TERMINAL_OUTPUT: &str = "read_terminal_output";
pub const LIST_TERMINALS: &str = "list_terminals";
pub const KILL_TERMINAL: &str = "kill_terminal";

pub const LIST_WORKSPACES: &str = "list_workspaces";
pub const GET_WORKSPACE: &str = "get_workspace";
pub const CREATE_WORKSPACE: &str = "create_workspace";
pub const DELETE_WORKSPACE: &str = "delete_workspace";

pub const READ_FILE: &str = "read_file";
