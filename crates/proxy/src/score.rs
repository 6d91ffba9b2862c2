use models::{DirectoryRecord, LoadMetrics};

/// Scalar used to pick among equivalent backends: occupancy weighted 0.7
/// plus a TPS-derived penalty weighted 0.3. Lower is better.
pub fn load_score(load: &LoadMetrics) -> f64 {
    let tps_penalty = (20.0 - load.tps).max(0.0) / 20.0;
    0.7 * load.occupancy() + 0.3 * tps_penalty
}

/// Order candidates best-first: lowest score, ties broken by the most
/// recent heartbeat.
pub fn rank(mut candidates: Vec<DirectoryRecord>) -> Vec<DirectoryRecord> {
    candidates.sort_by(|a, b| {
        load_score(&a.load)
            .partial_cmp(&load_score(&b.load))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.last_heartbeat_at.cmp(&a.last_heartbeat_at))
    });
    candidates
}
