//! Splitting datasets into chunks and reassembling results.

use crate::models::{Chunk, Dataset, DatasetSchema, Record};

/// Split records into ceil(n / chunk_size) contiguous chunks in original
/// order. The last chunk may be shorter. Each chunk receives an owned copy
/// of the schema.
pub fn split_into_chunks(
    schema: &DatasetSchema,
    records: Vec<Record>,
    chunk_size: usize,
) -> Vec<Chunk> {
    // Config validation rejects a zero chunk size; clamp anyway so a
    // hand-built config cannot spin the splitter forever.
    let chunk_size = chunk_size.max(1);

    let mut chunks = Vec::with_capacity(records.len().div_ceil(chunk_size));
    let mut records = records.into_iter().peekable();
    let mut chunk_id = 0;

    while records.peek().is_some() {
        let batch: Vec<Record> = records.by_ref().take(chunk_size).collect();
        chunks.push(Chunk {
            chunk_id,
            schema: schema.clone(),
            records: batch,
        });
        chunk_id += 1;
    }

    chunks
}

/// Concatenate successful chunks in original chunk order into one dataset
/// tagged with the source schema.
pub fn reassemble(schema: DatasetSchema, mut chunks: Vec<Chunk>) -> Dataset {
    chunks.sort_unstable_by_key(|c| c.chunk_id);
    let records = chunks.into_iter().flat_map(|c| c.records).collect();
    Dataset::new(schema, records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                let mut attrs = serde_json::Map::new();
                attrs.insert("seq".to_string(), json!(i));
                Record::new(attrs, None)
            })
            .collect()
    }

    fn schema() -> DatasetSchema {
        DatasetSchema::new("geometry", "EPSG:4326")
    }

    #[test]
    fn chunk_count_is_ceiling_of_ratio() {
        for (n, size, expected) in [(1000, 100, 10), (1001, 100, 11), (99, 100, 1), (0, 10, 0)] {
            let chunks = split_into_chunks(&schema(), records(n), size);
            assert_eq!(chunks.len(), expected, "n={n} size={size}");
            let total: usize = chunks.iter().map(Chunk::len).sum();
            assert_eq!(total, n);
        }
    }

    #[test]
    fn chunks_are_contiguous_and_ordered() {
        let chunks = split_into_chunks(&schema(), records(25), 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].len(), 5);

        let mut seq = 0;
        for (id, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_id, id);
            assert_eq!(chunk.schema, schema());
            for record in &chunk.records {
                assert_eq!(record.attributes["seq"], json!(seq));
                seq += 1;
            }
        }
    }

    #[test]
    fn reassemble_restores_original_order() {
        let mut chunks = split_into_chunks(&schema(), records(30), 10);
        chunks.reverse(); // completion order is unspecified
        let dataset = reassemble(schema(), chunks);

        assert_eq!(dataset.len(), 30);
        for (i, record) in dataset.records.iter().enumerate() {
            assert_eq!(record.attributes["seq"], json!(i));
        }
    }
}
