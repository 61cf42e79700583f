use super::coordinator::SyncSnapshot;
use crate::govee::device::Properties;

/// An optimistic change applied to one device ahead of the remote call that
/// makes it real. Holds the previous value of exactly the fields it touched,
/// so a rollback restores those fields and leaves everything else alone.
#[derive(Debug)]
pub struct Tentative {
    device_id: String,
    touched: Properties,
    previous: Properties,
    had_properties: bool,
}

impl Tentative {
    /// Applies `partial` to the device and returns the undo record, or `None`
    /// when the device is unknown.
    pub fn apply(snapshot: &mut SyncSnapshot, device_id: &str, partial: &Properties) -> Option<Tentative> {
        let device = snapshot.device_mut(device_id)?;

        let had_properties = device.properties.is_some();
        let properties = device.properties.get_or_insert_with(Properties::default);
        let previous = properties.project(partial);
        properties.merge(partial);

        Some(Tentative {
            device_id: device_id.to_string(),
            touched: partial.clone(),
            previous,
            had_properties,
        })
    }

    /// Puts back the pre-change value of every touched field.
    pub fn rollback(self, snapshot: &mut SyncSnapshot) -> bool {
        let Some(device) = snapshot.device_mut(&self.device_id) else {
            return false;
        };

        if let Some(properties) = &mut device.properties {
            properties.restore(&self.previous, &self.touched);

            if !self.had_properties && properties.is_empty() {
                device.properties = None;
            }
        }

        true
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}
