//! Entry point for the `execute` subcommand: the executor child.

use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};

use crate::error::Result;
use crate::instruction;
use crate::proto::InstructionSet;

/// Reads a marshaled instruction set from stdin until EOF, then runs each
/// instruction in order against the current working directory. User data
/// goes to stdout; diagnostics belong on stderr.
pub async fn run(note: &str) -> Result<()> {
    let mut encoded = Vec::new();
    tokio::io::stdin().read_to_end(&mut encoded).await?;
    let set = InstructionSet::decode(encoded.as_slice())?;

    tracing::info!(
        note,
        flow_hash_code = set.flow_hash_code,
        instructions = set.instructions.len(),
        "Running instruction set"
    );

    let work_dir = std::env::current_dir()?;
    let mut output = BufWriter::new(tokio::io::stdout());
    for instr in &set.instructions {
        let runner = instruction::runner_for(instr)?;
        runner.run(&work_dir, &mut output).await?;
    }
    output.flush().await?;
    Ok(())
}
