//! Recording firewall backend.

use crate::nat::{Chain, FirewallBackend, NatError, NatRule, Result};
use crate::netdriver::IpFamily;
use async_trait::async_trait;
use std::sync::Mutex;

#[derive(Default)]
struct State {
    chains: Vec<(IpFamily, Chain)>,
    rules: Vec<(IpFamily, NatRule)>,
    appends: usize,
}

pub struct FakeFirewall {
    name: &'static str,
    available: bool,
    /// Zero-based index of the append call that fails.
    fail_on_append: Option<usize>,
    state: Mutex<State>,
}

impl FakeFirewall {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            available: true,
            fail_on_append: None,
            state: Mutex::new(State::default()),
        }
    }

    /// A backend that is never available.
    pub fn unavailable(name: &'static str) -> Self {
        Self {
            available: false,
            ..Self::new(name)
        }
    }

    pub fn fail_on_append(mut self, n: usize) -> Self {
        self.fail_on_append = Some(n);
        self
    }

    pub fn chains(&self) -> Vec<(IpFamily, Chain)> {
        self.state.lock().unwrap().chains.clone()
    }

    pub fn rules(&self) -> Vec<(IpFamily, NatRule)> {
        self.state.lock().unwrap().rules.clone()
    }
}

#[async_trait]
impl FirewallBackend for FakeFirewall {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn is_available(&self, _family: IpFamily) -> bool {
        self.available
    }

    async fn new_chain(&self, family: IpFamily, chain: Chain) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.chains.contains(&(family, chain)) {
            state.chains.push((family, chain));
        }
        Ok(())
    }

    async fn append_rule(&self, family: IpFamily, rule: &NatRule) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let call = state.appends;
        state.appends += 1;
        if self.fail_on_append == Some(call) {
            return Err(NatError::Failed {
                program: "fake",
                stderr: "injected failure".to_string(),
            });
        }
        state.rules.push((family, rule.clone()));
        Ok(())
    }

    fn render(&self, family: IpFamily, rule: &NatRule) -> String {
        format!("{family} {rule:?}")
    }
}
