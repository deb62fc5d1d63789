use floating_distance::Metric;
use sqlx::Row;

use super::filters::SearchFilters;
use super::{EngineResult, SqlDb};

/// Vectors are stored as little-endian f32 blobs.
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine-normalize in place; zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: i64,
    pub distance: f32,
    pub similarity: f32,
}

/// Nearest neighbors by cosine distance over the snapshot's embeddings.
/// Filters narrow the candidate set in SQL before any ranking happens.
pub async fn search_vectors(
    db: &SqlDb,
    query_vector: &[f32],
    limit: usize,
    snapshot_id: i64,
    model: &str,
    filters: &SearchFilters,
) -> EngineResult<Vec<VectorHit>> {
    let (filter_sql, binds) = filters.to_sql();
    let sql = format!(
        "SELECT e.chunk_id, e.vector FROM embeddings e \
         JOIN chunks c ON c.id = e.chunk_id \
         JOIN files f ON f.id = c.file_id \
         WHERE e.snapshot_id = ? AND e.model = ?{filter_sql}"
    );

    let mut query = sqlx::query(&sql).bind(snapshot_id).bind(model);
    for bind in &binds {
        query = query.bind(bind.as_str());
    }
    let rows = query.fetch_all(db.as_ref()).await?;

    let metric = Metric::Cosine;
    let mut hits = rows
        .into_iter()
        .map(|row| {
            let chunk_id: i64 = row.get("chunk_id");
            let vector = decode_vector(row.get::<Vec<u8>, _>("vector").as_slice());
            let similarity = metric.measure::<f32>(&vector, query_vector);
            VectorHit {
                chunk_id,
                distance: 1.0 - similarity,
                similarity,
            }
        })
        .collect::<Vec<_>>();

    hits.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(limit);
    Ok(hits)
}
