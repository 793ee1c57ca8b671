use crate::types::Field;

pub const FIELD_TEMPERATURE: Field = Field::new(1);
pub const FIELD_HUMIDITY: Field = Field::new(2);

// remote-command layout
pub const FIELD_CLIM_STATUS: Field = Field::new(3);
pub const FIELD_TARGET_TEMPERATURE: Field = Field::new(4);

// heartbeat layout
pub const FIELD_FAKE_CLIM_TEMPERATURE: Field = Field::new(3);
pub const FIELD_HEARTBEAT_STATUS: Field = Field::new(4);
