// SPDX-License-Identifier: MPL-2.0

//! Typed publish/subscribe over a closed set of message kinds.
//!
//! A message enum implements [`Message`] to name the channel each variant is
//! published on. Handlers are reference-counted closures so that the exact
//! handler registered can later be removed with [`ChannelEmitter::off`].
//!
//! Dispatch is synchronous and runs on a snapshot of the channel's handler
//! list, so handlers may register or remove other handlers (or themselves)
//! while a dispatch is in progress.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    hash::Hash,
    rc::Rc,
};

use crate::transfer::Transfer;

/// A message kind that is published on a named channel.
pub trait Message {
    type Channel: Copy + Eq + Hash + fmt::Debug;

    fn channel(&self) -> Self::Channel;
}

/// Callback bound to a channel. Compared by reference on removal.
pub type Handler<M> = Rc<dyn Fn(&M, Option<&Transfer>)>;

/// Wrap a closure into a [`Handler`].
pub fn handler<M, F>(f: F) -> Handler<M>
where
    F: Fn(&M, Option<&Transfer>) + 'static,
{
    Rc::new(f)
}

struct Listener<M> {
    handler: Handler<M>,
    once: bool,
    fired: Cell<bool>,
}

pub struct ChannelEmitter<M: Message> {
    listeners: RefCell<HashMap<M::Channel, Vec<Rc<Listener<M>>>>>,
}

impl<M: Message> Default for ChannelEmitter<M> {
    fn default() -> Self {
        Self {
            listeners: RefCell::new(HashMap::new()),
        }
    }
}

impl<M: Message> ChannelEmitter<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler that fires on every dispatch of `channel`.
    pub fn on(&self, channel: M::Channel, handler: Handler<M>) {
        self.push(channel, handler, false);
    }

    /// Register a handler that fires on the next dispatch of `channel` only.
    pub fn once(&self, channel: M::Channel, handler: Handler<M>) {
        self.push(channel, handler, true);
    }

    /// Remove the first registration of `handler` on `channel`.
    ///
    /// Returns `false` if the handler was not registered there.
    pub fn off(&self, channel: M::Channel, handler: &Handler<M>) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let Some(list) = listeners.get_mut(&channel) else {
            return false;
        };

        let Some(position) = list
            .iter()
            .position(|listener| Rc::ptr_eq(&listener.handler, handler))
        else {
            return false;
        };

        list.remove(position);
        if list.is_empty() {
            listeners.remove(&channel);
        }
        true
    }

    /// Dispatch `message` to the handlers registered on its channel, in
    /// registration order. Returns the number of handlers invoked.
    pub fn emit(&self, message: &M, transfer: Option<&Transfer>) -> usize {
        let channel = message.channel();

        let snapshot = match self.listeners.borrow().get(&channel) {
            Some(list) => list.clone(),
            None => {
                tracing::trace!(?channel, "no listeners");
                return 0;
            }
        };

        let mut invoked = 0;
        for listener in snapshot {
            if listener.once && listener.fired.replace(true) {
                continue;
            }

            (listener.handler)(message, transfer);
            invoked += 1;

            if listener.once {
                self.detach(channel, &listener);
            }
        }

        invoked
    }

    /// Number of handlers currently registered on `channel`.
    #[must_use]
    pub fn listener_count(&self, channel: M::Channel) -> usize {
        self.listeners
            .borrow()
            .get(&channel)
            .map_or(0, Vec::len)
    }

    /// Drop every registration on every channel.
    pub fn clear(&self) {
        self.listeners.borrow_mut().clear();
    }

    fn push(&self, channel: M::Channel, handler: Handler<M>, once: bool) {
        self.listeners
            .borrow_mut()
            .entry(channel)
            .or_default()
            .push(Rc::new(Listener {
                handler,
                once,
                fired: Cell::new(false),
            }));
    }

    fn detach(&self, channel: M::Channel, listener: &Rc<Listener<M>>) {
        let mut listeners = self.listeners.borrow_mut();
        if let Some(list) = listeners.get_mut(&channel) {
            list.retain(|l| !Rc::ptr_eq(l, listener));
            if list.is_empty() {
                listeners.remove(&channel);
            }
        }
    }
}

impl<M: Message> fmt::Debug for ChannelEmitter<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.borrow();
        f.debug_map()
            .entries(listeners.iter().map(|(channel, list)| (channel, list.len())))
            .finish()
    }
}
