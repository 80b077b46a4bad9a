use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use arrow::error::ArrowError;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use tracing::info;

/// Writes `batch` as an Arrow IPC file at `path`, replacing any existing file.
pub fn write_ipc(path: &Path, batch: &RecordBatch) -> Result<(), ArrowError> {
    let file = File::create(path)?;
    let mut writer = FileWriter::try_new(BufWriter::new(file), &batch.schema())?;
    writer.write(batch)?;
    writer.finish()?;
    info!(
        "Wrote {} rows x {} columns to {}",
        batch.num_rows(),
        batch.num_columns(),
        path.display()
    );
    Ok(())
}
