//! In-memory Parquet file writer.
//!
//! Rows are buffered and converted to Arrow record batches every
//! `batch_size` rows, then streamed into an [`ArrowWriter`] backed by a
//! shared in-memory buffer. Closing the writer yields the finished bytes.

use bytes::{BufMut, Bytes, BytesMut};
use deltalake::arrow::datatypes::SchemaRef;
use deltalake::parquet::arrow::ArrowWriter;
use deltalake::parquet::basic::{Compression, GzipLevel, ZstdLevel};
use deltalake::parquet::file::properties::WriterProperties;
use snafu::prelude::*;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use floe_core::config::{KB, ParquetCompression};

use super::WriterOptions;
use super::arrow::{arrow_schema, rows_to_batch};
use crate::error::{
    BufferInUseSnafu, BufferLockSnafu, ParquetWriteSnafu, RecordBatchSnafu, WriterCreateSnafu,
    WriterError,
};
use crate::schema::TableSchema;
use crate::value::Row;

/// A buffer with interior mutability for the ArrowWriter.
#[derive(Clone)]
struct SharedBuffer {
    buffer: Arc<Mutex<bytes::buf::Writer<BytesMut>>>,
}

impl SharedBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(BytesMut::with_capacity(capacity).writer())),
        }
    }

    fn into_inner(self) -> Result<BytesMut, WriterError> {
        let mutex = Arc::into_inner(self.buffer).context(BufferInUseSnafu)?;
        let writer = mutex.into_inner().map_err(|_| BufferLockSnafu.build())?;
        Ok(writer.into_inner())
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut buffer = self.buffer.try_lock().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::WouldBlock, "buffer lock contention")
        })?;
        Write::write(&mut *buffer, buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn writer_properties(compression: ParquetCompression) -> WriterProperties {
    let compression = match compression {
        ParquetCompression::Uncompressed => Compression::UNCOMPRESSED,
        ParquetCompression::Snappy => Compression::SNAPPY,
        ParquetCompression::Gzip => Compression::GZIP(GzipLevel::default()),
        ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
        ParquetCompression::Lz4 => Compression::LZ4,
    };
    WriterProperties::builder()
        .set_compression(compression)
        .build()
}

/// A finished Parquet file held in memory.
#[derive(Debug, Clone)]
pub struct ParquetBytes {
    pub bytes: Bytes,
    pub record_count: u64,
}

/// Writes rows of one schema into a single Parquet file.
pub struct ParquetFileWriter {
    schema: Arc<TableSchema>,
    arrow_schema: SchemaRef,
    writer: ArrowWriter<SharedBuffer>,
    buffer: SharedBuffer,
    pending: Vec<Row>,
    batch_size: usize,
    records_written: u64,
}

impl ParquetFileWriter {
    pub fn new(schema: Arc<TableSchema>, options: &WriterOptions) -> Result<Self, WriterError> {
        let arrow_schema = arrow_schema(&schema);
        let buffer = SharedBuffer::new(64 * KB);
        let writer = ArrowWriter::try_new(
            buffer.clone(),
            arrow_schema.clone(),
            Some(writer_properties(options.compression)),
        )
        .context(WriterCreateSnafu)?;

        Ok(Self {
            schema,
            arrow_schema,
            writer,
            buffer,
            pending: Vec::new(),
            batch_size: options.batch_size.max(1),
            records_written: 0,
        })
    }

    /// Rows accepted so far, including those not yet encoded.
    pub fn record_count(&self) -> u64 {
        self.records_written + self.pending.len() as u64
    }

    pub fn write(&mut self, row: Row) -> Result<(), WriterError> {
        self.pending.push(row);
        if self.pending.len() >= self.batch_size {
            self.flush_pending()?;
        }
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<(), WriterError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = rows_to_batch(&self.schema, &self.arrow_schema, &self.pending)
            .context(RecordBatchSnafu)?;
        self.writer.write(&batch).context(ParquetWriteSnafu)?;
        self.records_written += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }

    /// Finish the file. Returns `None` when no rows were written.
    pub fn close(mut self) -> Result<Option<ParquetBytes>, WriterError> {
        self.flush_pending()?;
        if self.records_written == 0 {
            return Ok(None);
        }

        let start = Instant::now();
        self.writer.close().context(ParquetWriteSnafu)?;
        let bytes = self.buffer.into_inner()?.freeze();
        tracing::trace!(
            bytes = bytes.len(),
            records = self.records_written,
            duration_ms = start.elapsed().as_millis(),
            "Closed parquet writer"
        );

        Ok(Some(ParquetBytes {
            bytes,
            record_count: self.records_written,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::demo_schema;
    use crate::value::Value;
    use crate::writer::arrow::batch_to_rows;
    use deltalake::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    fn read_back(schema: &TableSchema, bytes: Bytes) -> Vec<Row> {
        let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)
            .unwrap()
            .build()
            .unwrap();
        reader
            .flat_map(|batch| batch_to_rows(schema, &batch.unwrap()).unwrap())
            .collect()
    }

    fn rows(n: i32) -> Vec<Row> {
        (0..n)
            .map(|i| {
                vec![
                    Value::Int32(i),
                    Value::Utf8(format!("name-{i}")),
                    Value::Utf8("aaa".into()),
                ]
            })
            .collect()
    }

    #[test]
    fn test_empty_writer_produces_no_file() {
        let writer =
            ParquetFileWriter::new(Arc::new(demo_schema()), &WriterOptions::default()).unwrap();
        assert!(writer.close().unwrap().is_none());
    }

    #[test]
    fn test_rows_span_multiple_batches() {
        let schema = Arc::new(demo_schema());
        let options = WriterOptions {
            batch_size: 3,
            ..Default::default()
        };
        let mut writer = ParquetFileWriter::new(schema.clone(), &options).unwrap();
        for row in rows(10) {
            writer.write(row).unwrap();
        }
        assert_eq!(writer.record_count(), 10);

        let file = writer.close().unwrap().unwrap();
        assert_eq!(file.record_count, 10);
        assert_eq!(read_back(&schema, file.bytes), rows(10));
    }

    #[test]
    fn test_every_compression_codec_writes() {
        let schema = Arc::new(demo_schema());
        for compression in [
            ParquetCompression::Uncompressed,
            ParquetCompression::Snappy,
            ParquetCompression::Gzip,
            ParquetCompression::Zstd,
            ParquetCompression::Lz4,
        ] {
            let options = WriterOptions {
                compression,
                ..Default::default()
            };
            let mut writer = ParquetFileWriter::new(schema.clone(), &options).unwrap();
            for row in rows(4) {
                writer.write(row).unwrap();
            }
            let file = writer.close().unwrap().unwrap();
            assert_eq!(read_back(&schema, file.bytes).len(), 4, "{compression:?}");
        }
    }
}
