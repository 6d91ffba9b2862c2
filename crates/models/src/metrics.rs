/// Load sample carried by heartbeats and status broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadMetrics {
    pub player_count: u32,
    pub max_players: u32,
    /// Ticks per second of the game loop; 20.0 is a healthy backend.
    pub tps: f64,
    /// Round-trip time of the last registry exchange, in milliseconds.
    pub response_time: u32,
}

impl LoadMetrics {
    /// Fraction of player capacity in use, in `[0, 1]`. A backend that
    /// advertises no capacity is treated as full.
    pub fn occupancy(&self) -> f64 {
        if self.max_players == 0 {
            1.0
        } else {
            f64::from(self.player_count) / f64::from(self.max_players)
        }
    }
}

impl Default for LoadMetrics {
    fn default() -> Self {
        Self {
            player_count: 0,
            max_players: 0,
            tps: 20.0,
            response_time: 0,
        }
    }
}
