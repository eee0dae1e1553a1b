//! Fault injection around provider calls.

use std::collections::VecDeque;
use std::sync::Mutex;

use runwarden_core::{ProviderError, RunId};

/// Where in the execution a fault may be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    BeforeProviderCall,
    AfterProviderCall,
}

/// A fault to simulate at a [`FaultPoint`].
#[derive(Debug, Clone, PartialEq)]
pub enum InjectedFault {
    /// Behave as if the execution timeout elapsed.
    Timeout,
    /// Behave as if the process were shutting down mid-call.
    Interrupt,
    /// Behave as if the provider returned this error.
    ProviderError(ProviderError),
}

/// Consulted before and after every provider call.
pub trait FaultInjector: Send + Sync {
    fn check(&self, run_id: &RunId, point: FaultPoint) -> Option<InjectedFault>;
}

/// Never injects anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFaultInjector;

impl FaultInjector for NoopFaultInjector {
    fn check(&self, _run_id: &RunId, _point: FaultPoint) -> Option<InjectedFault> {
        None
    }
}

/// Injects a queue of faults at one point, in order, once each.
#[derive(Debug, Default)]
pub struct ScriptedFaultInjector {
    script: Mutex<VecDeque<(FaultPoint, InjectedFault)>>,
}

impl ScriptedFaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fault.
    pub fn push(&self, point: FaultPoint, fault: InjectedFault) {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back((point, fault));
    }

    /// Number of faults not yet injected.
    pub fn remaining(&self) -> usize {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl FaultInjector for ScriptedFaultInjector {
    fn check(&self, _run_id: &RunId, point: FaultPoint) -> Option<InjectedFault> {
        let mut script = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match script.front() {
            Some((p, _)) if *p == point => script.pop_front().map(|(_, fault)| fault),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_faults_fire_in_order_at_their_point() {
        let injector = ScriptedFaultInjector::new();
        let run = RunId::new("r1");
        injector.push(FaultPoint::BeforeProviderCall, InjectedFault::Timeout);
        injector.push(FaultPoint::AfterProviderCall, InjectedFault::Interrupt);

        assert_eq!(injector.check(&run, FaultPoint::AfterProviderCall), None);
        assert_eq!(
            injector.check(&run, FaultPoint::BeforeProviderCall),
            Some(InjectedFault::Timeout)
        );
        assert_eq!(
            injector.check(&run, FaultPoint::AfterProviderCall),
            Some(InjectedFault::Interrupt)
        );
        assert_eq!(injector.remaining(), 0);
    }
}
