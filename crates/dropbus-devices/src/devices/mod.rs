/*!
 * Driver implementations for dropbus.
 */

pub mod sensor;

pub use sensor::{SensorDriver, SensorHandle, SensorState, SENSOR_CLASS};
