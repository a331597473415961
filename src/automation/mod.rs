//! Device automation: the activation state machine, its threaded driver and
//! the devices it commands.

mod device;
mod dispatcher;
mod machine;
mod mqtt_device;
mod session;

use std::sync::Arc;

use crate::config::DeviceSettings;
use crate::transport::MessagePublisher;

pub use device::{CommandError, CommandParams, DesiredState, Device, DeviceCategory, LogDevice};
pub use dispatcher::{
    activation_plan, deactivation_plan, Dispatcher, NoopObserver, SessionObserver,
};
pub use machine::{ActivationMachine, EventEffect};
pub use mqtt_device::MqttDevice;
pub use session::{ActivationSession, CommandOutcome, Phase, Trigger};

/// Build the configured devices. Without a publisher every device only logs.
pub fn build_devices(
    settings: &[DeviceSettings],
    topic_prefix: &str,
    publisher: Option<Arc<dyn MessagePublisher>>,
) -> Vec<Arc<dyn Device>> {
    settings
        .iter()
        .map(|device| -> Arc<dyn Device> {
            match &publisher {
                Some(publisher) => Arc::new(MqttDevice::new(
                    device.clone(),
                    topic_prefix,
                    Arc::clone(publisher),
                )),
                None => Arc::new(LogDevice::new(
                    device.id.clone(),
                    device.category,
                    device.priority,
                )),
            }
        })
        .collect()
}
