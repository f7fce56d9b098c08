use indexmap::IndexMap;
use tracing::debug;

use crate::channel::{ChannelContext, ChannelState, Subscribable};

/// All live channels of one connection, keyed by name
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    channels: IndexMap<String, ChannelState>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a channel, creating the variant its name selects if absent
    pub fn get_or_create(&mut self, name: &str) -> &mut ChannelState {
        self.channels.entry(name.to_string()).or_insert_with(|| {
            debug!("Creating channel {}", name);
            ChannelState::new(name)
        })
    }

    pub fn get(&self, name: &str) -> Option<&ChannelState> {
        self.channels.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ChannelState> {
        self.channels.get_mut(name)
    }

    pub fn subscribe(&mut self, name: &str, ctx: &mut dyn ChannelContext, force: bool) {
        self.get_or_create(name).subscribe(ctx, force);
    }

    pub fn remove(&mut self, name: &str) -> Option<ChannelState> {
        self.channels.shift_remove(name)
    }

    pub fn for_each(&mut self, mut f: impl FnMut(&mut ChannelState)) {
        for channel in self.channels.values_mut() {
            f(channel);
        }
    }

    /// Remove every channel, handing each to `f` on the way out
    pub fn drain(&mut self, mut f: impl FnMut(ChannelState)) {
        for (_, channel) in self.channels.drain(..) {
            f(channel);
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }
}
