use crate::{error::SensorError, ticks::Ticks, types::Reading};

/// Temperature/humidity source. One call triggers exactly one measurement.
pub trait Sensor {
    fn measure(&mut self, now: Ticks) -> Result<Reading, SensorError>;
}

impl<S: Sensor + ?Sized> Sensor for Box<S> {
    fn measure(&mut self, now: Ticks) -> Result<Reading, SensorError> {
        (**self).measure(now)
    }
}
