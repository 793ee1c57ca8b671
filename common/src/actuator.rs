pub trait Actuator {
    fn set(&mut self, on: bool);
    fn get(&self) -> bool;
}

impl<A: Actuator + ?Sized> Actuator for Box<A> {
    fn set(&mut self, on: bool) {
        (**self).set(on)
    }

    fn get(&self) -> bool {
        (**self).get()
    }
}

/// Pin level that puts a relay in the requested state.
pub fn relay_level(on: bool, active_low: bool) -> bool {
    on != active_low
}
