use serde::{Deserialize, Serialize};

/// `id = instance_type + "." + az`. Immutable except for metrics fields
/// (`avg_boot_time_seconds`, `sample_count`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: String,
    pub instance_type: String,
    pub az: String,
    pub region: String,
    pub avg_boot_time_seconds: Option<f64>,
    pub boot_time_sample_count: u32,
    pub is_active: bool,
}

impl Pool {
    pub fn id_for(instance_type: &str, az: &str) -> String {
        format!("{instance_type}.{az}")
    }

    pub fn new(instance_type: impl Into<String>, az: impl Into<String>, region: impl Into<String>) -> Self {
        let instance_type = instance_type.into();
        let az = az.into();
        Self {
            id: Pool::id_for(&instance_type, &az),
            instance_type,
            az,
            region: region.into(),
            avg_boot_time_seconds: None,
            boot_time_sample_count: 0,
            is_active: true,
        }
    }

    /// Rolling mean update, called whenever a replica boot duration becomes
    /// known (see `emergency::record_boot_duration`).
    pub fn record_boot_time(&mut self, seconds: f64) {
        let n = self.boot_time_sample_count as f64;
        let prev = self.avg_boot_time_seconds.unwrap_or(0.0);
        self.avg_boot_time_seconds = Some((prev * n + seconds) / (n + 1.0));
        self.boot_time_sample_count += 1;
    }
}
