use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};

use super::row;
use crate::error::Result;

/// Merges rows from each input file, in input order, into one output stream.
#[derive(Debug)]
pub struct MergeTo {
    input_files: Vec<String>,
}

impl MergeTo {
    pub fn new(input_files: Vec<String>) -> Self {
        Self { input_files }
    }

    pub async fn run<W: AsyncWrite + Unpin>(&self, work_dir: &Path, output: &mut W) -> Result<()> {
        for name in &self.input_files {
            let file = File::open(work_dir.join(name)).await?;
            let mut reader = BufReader::new(file);
            while let Some(row) = row::read_row(&mut reader).await? {
                row::write_row(output, &row).await?;
            }
        }
        output.flush().await?;
        Ok(())
    }
}
