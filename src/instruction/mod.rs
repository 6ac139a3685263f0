//! Executable dataflow instructions.
//!
//! An [`InstructionSet`](crate::proto::InstructionSet) arrives on the
//! executor child's stdin; each instruction is dispatched to its runner by
//! which detail message is present, and runners write user data to the
//! child's stdout as length-prefixed rows.

pub mod merge_to;
pub mod row;

use std::path::Path;

use tokio::io::AsyncWrite;

pub use merge_to::MergeTo;

use crate::error::{AgentError, Result};
use crate::proto;

/// A dispatched instruction, ready to run against a working directory.
#[derive(Debug)]
pub enum Runner {
    MergeTo(MergeTo),
}

/// Selects the runner for an instruction by detail-message presence.
pub fn runner_for(instruction: &proto::Instruction) -> Result<Runner> {
    if let Some(merge_to) = &instruction.merge_to {
        return Ok(Runner::MergeTo(MergeTo::new(merge_to.input_files.clone())));
    }
    Err(AgentError::UnsupportedInstruction(instruction.name.clone()))
}

impl Runner {
    pub async fn run<W: AsyncWrite + Unpin>(&self, work_dir: &Path, output: &mut W) -> Result<()> {
        match self {
            Runner::MergeTo(merge_to) => merge_to.run(work_dir, output).await,
        }
    }
}
