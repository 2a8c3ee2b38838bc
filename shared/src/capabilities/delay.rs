use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ask the shell to wait, then resume the core.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DelayOperation {
    pub millis: u64,
}

impl Operation for DelayOperation {
    type Output = ();
}

pub struct Delay<E> {
    context: CapabilityContext<DelayOperation, E>,
}

impl<Ev> Capability<Ev> for Delay<Ev> {
    type Operation = DelayOperation;
    type MappedSelf<MappedEv> = Delay<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Delay::new(self.context.map_event(f))
    }
}

impl<E> Delay<E>
where
    E: Send + 'static,
{
    pub fn new(context: CapabilityContext<DelayOperation, E>) -> Self {
        Self { context }
    }

    pub fn after(&self, duration: Duration, event: E) {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let context = self.context.clone();
        self.context.spawn(async move {
            context.request_from_shell(DelayOperation { millis }).await;
            context.update_app(event);
        });
    }
}
