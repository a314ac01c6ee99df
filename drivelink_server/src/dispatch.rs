// Message-id → handler table used by the update tick.
//
// Built once when the server is constructed. `RegisterClient` and
// `UnregisterClient` are absent: connections handle those on their reader
// threads. Response ids are absent too, since clients never send them. A
// queued message whose id has no entry is logged and dropped.

use std::collections::HashMap;

use drivelink_protocol::MessageId;

/// The request kinds the update tick knows how to handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handler {
    RegisterCaptureCamera,
    RequestAgentControl,
    ReleaseAgentControl,
    ResetAgent,
    SetAgentControlValues,
    ActivateSynchronousStepping,
    DeactivateSynchronousStepping,
    AdvanceSynchronousStepping,
    ResetSimulation,
    SetSunSimulation,
}

#[derive(Debug)]
pub struct DispatchTable {
    handlers: HashMap<MessageId, Handler>,
}

impl DispatchTable {
    /// Every request the server answers from the update tick.
    pub fn standard() -> Self {
        let handlers = HashMap::from([
            (
                MessageId::RegisterCaptureCameraRequest,
                Handler::RegisterCaptureCamera,
            ),
            (
                MessageId::RequestAgentControlRequest,
                Handler::RequestAgentControl,
            ),
            (
                MessageId::ReleaseAgentControlRequest,
                Handler::ReleaseAgentControl,
            ),
            (MessageId::ResetAgentRequest, Handler::ResetAgent),
            (
                MessageId::SetAgentControlValuesRequest,
                Handler::SetAgentControlValues,
            ),
            (
                MessageId::ActivateSynchronousSteppingRequest,
                Handler::ActivateSynchronousStepping,
            ),
            (
                MessageId::DeactivateSynchronousSteppingRequest,
                Handler::DeactivateSynchronousStepping,
            ),
            (
                MessageId::AdvanceSynchronousSteppingRequest,
                Handler::AdvanceSynchronousStepping,
            ),
            (MessageId::ResetSimulationRequest, Handler::ResetSimulation),
            (MessageId::SetSunSimulationRequest, Handler::SetSunSimulation),
        ]);
        Self { handlers }
    }

    /// Look up the handler for a raw wire id.
    pub fn lookup(&self, raw_id: u32) -> Option<Handler> {
        let id = MessageId::try_from(raw_id).ok()?;
        self.handlers.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_table_covers_tick_requests() {
        let table = DispatchTable::standard();
        assert_eq!(table.len(), 10);
        assert_eq!(
            table.lookup(MessageId::SetSunSimulationRequest.as_u32()),
            Some(Handler::SetSunSimulation)
        );
        assert_eq!(
            table.lookup(MessageId::AdvanceSynchronousSteppingRequest.as_u32()),
            Some(Handler::AdvanceSynchronousStepping)
        );
    }

    #[test]
    fn connection_level_and_response_ids_are_absent() {
        let table = DispatchTable::standard();
        assert_eq!(table.lookup(MessageId::RegisterClientRequest.as_u32()), None);
        assert_eq!(
            table.lookup(MessageId::UnregisterClientRequest.as_u32()),
            None
        );
        assert_eq!(table.lookup(MessageId::ResetAgentResponse.as_u32()), None);
        assert_eq!(table.lookup(MessageId::Undefined.as_u32()), None);
    }

    #[test]
    fn unknown_ids_are_absent() {
        let table = DispatchTable::standard();
        assert_eq!(table.lookup(24), None);
        assert_eq!(table.lookup(u32::MAX), None);
    }
}
