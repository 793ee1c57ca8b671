use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempRange {
    #[serde(rename = "minC")]
    pub min_c: f32,
    #[serde(rename = "maxC")]
    pub max_c: f32,
}

impl Default for TempRange {
    fn default() -> Self {
        Self {
            min_c: 16.0,
            max_c: 30.0,
        }
    }
}

impl TempRange {
    /// NaN maps to `min_c`. Assumes `min_c <= max_c`, see `sanitize`.
    pub fn clamp(self, temp_c: f32) -> f32 {
        temp_c.max(self.min_c).min(self.max_c)
    }

    pub fn sanitize(&mut self) {
        if !self.min_c.is_finite() || !self.max_c.is_finite() {
            *self = Self::default();
            return;
        }
        if self.min_c > self.max_c {
            std::mem::swap(&mut self.min_c, &mut self.max_c);
        }
    }
}

/// Stand-in for the temperature an air conditioner would report: the real
/// reading pinned into the unit's settable range.
pub fn fake_clim_temperature(real_temp_c: f32, range: TempRange) -> f32 {
    range.clamp(real_temp_c)
}
