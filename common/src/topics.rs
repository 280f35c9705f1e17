use crate::types::PumpId;

pub const SUFFIX_SCHEDULE_ADD: &str = "/con/schedule/add";
pub const SUFFIX_SCHEDULE_DELETE: &str = "/con/schedule/delete";
pub const SUFFIX_REQUEST_STATUS: &str = "/con/request_status";
pub const SUFFIX_SCHEDULES: &str = "/sta/schedules";
pub const SUFFIX_ONLINE: &str = "/sta/online";
pub const SUFFIX_LOG: &str = "/sta/log";
pub const SUFFIX_HEARTBEAT: &str = "/a";

/// Topic set for one device, all rooted at `<id>/DOSE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoseTopics {
    base: String,
}

/// An inbound topic resolved against the device's subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundTopic {
    PumpCommand(PumpId),
    ScheduleAdd,
    ScheduleDelete,
    RequestStatus,
}

impl DoseTopics {
    pub fn new(device_id: &str) -> Self {
        Self {
            base: format!("{device_id}/DOSE"),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn pump_command(&self, pump: PumpId) -> String {
        format!("{}/con/pump{}", self.base, pump.number())
    }

    pub fn pump_status(&self, pump: PumpId) -> String {
        format!("{}/sta/pump{}", self.base, pump.number())
    }

    pub fn schedule_add(&self) -> String {
        format!("{}{SUFFIX_SCHEDULE_ADD}", self.base)
    }

    pub fn schedule_delete(&self) -> String {
        format!("{}{SUFFIX_SCHEDULE_DELETE}", self.base)
    }

    pub fn request_status(&self) -> String {
        format!("{}{SUFFIX_REQUEST_STATUS}", self.base)
    }

    pub fn schedules(&self) -> String {
        format!("{}{SUFFIX_SCHEDULES}", self.base)
    }

    pub fn online(&self) -> String {
        format!("{}{SUFFIX_ONLINE}", self.base)
    }

    pub fn log(&self) -> String {
        format!("{}{SUFFIX_LOG}", self.base)
    }

    pub fn heartbeat(&self) -> String {
        format!("{}{SUFFIX_HEARTBEAT}", self.base)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = PumpId::ALL
            .into_iter()
            .map(|pump| self.pump_command(pump))
            .collect();
        topics.push(self.schedule_add());
        topics.push(self.schedule_delete());
        topics.push(self.request_status());
        topics
    }

    pub fn classify(&self, topic: &str) -> Option<InboundTopic> {
        let suffix = topic.strip_prefix(self.base.as_str())?;
        match suffix {
            "/con/pump1" => Some(InboundTopic::PumpCommand(PumpId::One)),
            "/con/pump2" => Some(InboundTopic::PumpCommand(PumpId::Two)),
            SUFFIX_SCHEDULE_ADD => Some(InboundTopic::ScheduleAdd),
            SUFFIX_SCHEDULE_DELETE => Some(InboundTopic::ScheduleDelete),
            SUFFIX_REQUEST_STATUS => Some(InboundTopic::RequestStatus),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_prefixed_with_device_id() {
        let topics = DoseTopics::new("tank-a");
        assert_eq!(topics.pump_command(PumpId::One), "tank-a/DOSE/con/pump1");
        assert_eq!(topics.pump_status(PumpId::Two), "tank-a/DOSE/sta/pump2");
        assert_eq!(topics.heartbeat(), "tank-a/DOSE/a");
        assert_eq!(topics.subscriptions().len(), 5);
    }

    #[test]
    fn classify_ignores_foreign_devices() {
        let topics = DoseTopics::new("tank-a");
        assert_eq!(
            topics.classify("tank-a/DOSE/con/pump2"),
            Some(InboundTopic::PumpCommand(PumpId::Two))
        );
        assert_eq!(
            topics.classify("tank-a/DOSE/con/request_status"),
            Some(InboundTopic::RequestStatus)
        );
        assert_eq!(topics.classify("tank-b/DOSE/con/pump1"), None);
        assert_eq!(topics.classify("tank-a/DOSE/sta/pump1"), None);
    }
}
