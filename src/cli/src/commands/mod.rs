//! CLI command definitions and dispatch.

mod create;
mod publish;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use airlift_core::MirrorError;

/// Exit code for a clean run.
pub const EXIT_OK: i32 = 0;
/// Exit code for any fatal error.
pub const EXIT_ERROR: i32 = 1;
/// Exit code for an out-of-order imageset at publish.
pub const EXIT_SEQUENCE: i32 = 2;

/// Airlift mirrors imagesets into disconnected registries.
#[derive(Parser)]
#[command(name = "airlift", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Resolve the imageset configuration and build a portable archive
    Create(create::CreateArgs),
    /// Publish a portable archive into a mirror registry
    Publish(publish::PublishArgs),
}

/// Default workspace when --dir is not given (~/.airlift).
pub(crate) fn default_workspace() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".airlift"))
        .unwrap_or_else(|| PathBuf::from(".airlift"))
}

/// Dispatch a parsed CLI to the appropriate command handler, mapping the
/// error taxonomy to exit codes.
pub async fn dispatch(cli: Cli) -> i32 {
    let result = match cli.command {
        Command::Create(args) => create::execute(args).await,
        Command::Publish(args) => publish::execute(args).await,
    };

    match result {
        Ok(()) => EXIT_OK,
        Err(err) => {
            eprintln!("Error: {err}");
            exit_code_for(&err)
        }
    }
}

pub(crate) fn exit_code_for(err: &MirrorError) -> i32 {
    let sequence_mismatch = err
        .leaves()
        .iter()
        .any(|e| matches!(e, MirrorError::Sequence { .. }));
    if sequence_mismatch {
        EXIT_SEQUENCE
    } else {
        EXIT_ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_for_sequence() {
        let err = MirrorError::Sequence {
            expected: 2,
            got: 3,
        };
        assert_eq!(exit_code_for(&err), EXIT_SEQUENCE);
    }

    #[test]
    fn test_exit_code_for_nested_sequence() {
        let err = MirrorError::Aggregate(vec![
            MirrorError::Config("x".into()),
            MirrorError::Sequence {
                expected: 1,
                got: 5,
            },
        ]);
        assert_eq!(exit_code_for(&err), EXIT_SEQUENCE);
    }

    #[test]
    fn test_exit_code_for_other_errors() {
        assert_eq!(exit_code_for(&MirrorError::Config("x".into())), EXIT_ERROR);
        assert_eq!(exit_code_for(&MirrorError::Auth("reg".into())), EXIT_ERROR);
    }
}
