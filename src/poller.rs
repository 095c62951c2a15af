//! # Contexted poller
//! Splits one shared completion queue into one logical stream per `Kind`,
//! so independent consumers can each drain "their" completions without
//! stepping on each other or dropping anything the others produced.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::codec::{Kind, Packer};
use crate::error::{Error, Result};

/// Anything that can be asked to drain raw completions into a caller-owned
/// buffer. Implemented by the verbs completion queue in production, and by a
/// canned sequence of work completions in tests.
pub trait RawPoller<Wc> {
    fn poll_raw(&self, out: &mut Vec<Wc>, capacity: usize) -> Result<()>;
}

struct Shared<K: Kind, Wc> {
    packer: Packer<K>,
    holdovers: HashMap<u64, VecDeque<Wc>>,
    registered: HashMap<u64, bool>,
    frozen: bool,
}

/// Owns the registration protocol and hands out one [`ContextedPoller`] per
/// registered kind. Must be built, have every kind registered, and then be
/// frozen with [`PollerManager::end_registrations`] before any poll happens.
pub struct PollerManager<K: Kind, Wc> {
    shared: Rc<RefCell<Shared<K, Wc>>>,
}

impl<K: Kind, Wc: Clone> PollerManager<K, Wc> {
    pub fn new(max_peer_id: u64) -> Result<Self> {
        let packer = Packer::new(max_peer_id)?;
        Ok(PollerManager {
            shared: Rc::new(RefCell::new(Shared {
                packer,
                holdovers: HashMap::new(),
                registered: HashMap::new(),
                frozen: false,
            })),
        })
    }

    /// Registers interest in `kind`. Must be called before
    /// [`end_registrations`](Self::end_registrations).
    pub fn register_context(&mut self, kind: K) -> Result<()> {
        let mut shared = self.shared.borrow_mut();
        if shared.frozen {
            return Err(Error::config("cannot register a context after freezing"));
        }
        let ord = kind.ordinal();
        if shared.registered.contains_key(&ord) {
            return Err(Error::config(format!(
                "kind with ordinal {} is already registered",
                ord
            )));
        }
        shared.registered.insert(ord, true);
        shared.holdovers.insert(ord, VecDeque::new());
        Ok(())
    }

    /// Freezes the manager once exactly `expected_count` kinds have been
    /// registered.
    pub fn end_registrations(&mut self, expected_count: usize) -> Result<()> {
        let mut shared = self.shared.borrow_mut();
        if shared.registered.len() != expected_count {
            return Err(Error::config(format!(
                "expected {} registered kinds, got {}",
                expected_count,
                shared.registered.len()
            )));
        }
        shared.frozen = true;
        Ok(())
    }

    /// Returns the poller for `kind`. Only valid after freezing.
    pub fn get(&self, kind: K) -> Result<ContextedPoller<K, Wc>> {
        let shared = self.shared.borrow();
        if !shared.frozen {
            return Err(Error::config("poller manager is not frozen yet"));
        }
        let ord = kind.ordinal();
        if !shared.registered.contains_key(&ord) {
            return Err(Error::not_found(format!(
                "kind with ordinal {} was never registered",
                ord
            )));
        }
        drop(shared);
        Ok(ContextedPoller {
            kind,
            shared: Rc::clone(&self.shared),
        })
    }
}

/// A single kind's view of the shared completion queue. Not `Sync`:
/// callers must serialize access themselves, e.g. by pinning one owning
/// thread per kind, matching the underlying verbs poll's own non-atomicity.
pub struct ContextedPoller<K: Kind, Wc> {
    kind: K,
    shared: Rc<RefCell<Shared<K, Wc>>>,
}

impl<K: Kind, Wc: Clone> ContextedPoller<K, Wc> {
    /// Drains this kind's stream into `out`, up to `out.capacity()` entries.
    ///
    /// Serves from the holdover FIFO first. If it is empty, polls
    /// `raw_poller` and routes each completion either into `out` (if it
    /// belongs to this kind) or into the holdover FIFO of whichever kind it
    /// does belong to. Returns `Ok(true)` if anything was produced.
    pub fn poll_into(&self, out: &mut Vec<Wc>, raw_poller: &dyn RawPoller<Wc>) -> Result<bool>
    where
        Wc: HasWrId,
    {
        out.clear();
        let capacity = out.capacity();
        let my_ord = self.kind.ordinal();

        {
            let mut shared = self.shared.borrow_mut();
            let fifo = shared
                .holdovers
                .get_mut(&my_ord)
                .expect("kind was registered, so its holdover exists");
            while out.len() < capacity {
                match fifo.pop_front() {
                    Some(wc) => out.push(wc),
                    None => break,
                }
            }
        }

        if !out.is_empty() {
            return Ok(true);
        }

        let mut scratch = Vec::with_capacity(capacity);
        raw_poller.poll_raw(&mut scratch, capacity)?;

        let mut shared = self.shared.borrow_mut();
        for wc in scratch {
            let k = shared.packer.unpack_kind(wc.wr_id());
            if k.ordinal() == my_ord {
                out.push(wc);
            } else {
                shared
                    .holdovers
                    .entry(k.ordinal())
                    .or_insert_with(VecDeque::new)
                    .push_back(wc);
            }
        }

        Ok(!out.is_empty())
    }
}

/// Completions need to expose their packed `wr_id` so the poller can decode
/// which kind they belong to.
pub trait HasWrId {
    fn wr_id(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Kd {
        Ctrl,
        Data,
    }

    impl Kind for Kd {
        const MAX_ORDINAL: u64 = 1;
        fn ordinal(&self) -> u64 {
            match self {
                Kd::Ctrl => 0,
                Kd::Data => 1,
            }
        }
        fn from_ordinal(o: u64) -> Self {
            match o {
                0 => Kd::Ctrl,
                1 => Kd::Data,
                _ => panic!("bad ordinal"),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Wc(u64);
    impl HasWrId for Wc {
        fn wr_id(&self) -> u64 {
            self.0
        }
    }

    struct Canned(RefCell<VecDeque<Wc>>);
    impl RawPoller<Wc> for Canned {
        fn poll_raw(&self, out: &mut Vec<Wc>, capacity: usize) -> Result<()> {
            let mut q = self.0.borrow_mut();
            for _ in 0..capacity {
                match q.pop_front() {
                    Some(wc) => out.push(wc),
                    None => break,
                }
            }
            Ok(())
        }
    }

    fn packer() -> Packer<Kd> {
        Packer::new(1).unwrap()
    }

    #[test]
    fn registration_requires_matching_count() {
        let mut mgr: PollerManager<Kd, Wc> = PollerManager::new(1).unwrap();
        mgr.register_context(Kd::Ctrl).unwrap();
        assert!(mgr.end_registrations(2).is_err());
        mgr.register_context(Kd::Data).unwrap();
        assert!(mgr.end_registrations(2).is_ok());
    }

    #[test]
    fn double_registration_fails() {
        let mut mgr: PollerManager<Kd, Wc> = PollerManager::new(1).unwrap();
        mgr.register_context(Kd::Ctrl).unwrap();
        assert!(mgr.register_context(Kd::Ctrl).is_err());
    }

    #[test]
    fn get_before_freeze_fails() {
        let mut mgr: PollerManager<Kd, Wc> = PollerManager::new(1).unwrap();
        mgr.register_context(Kd::Ctrl).unwrap();
        assert!(mgr.get(Kd::Ctrl).is_err());
    }

    #[test]
    fn routes_foreign_kind_to_holdover_and_preserves_fifo_order() {
        let p = packer();
        let mut mgr: PollerManager<Kd, Wc> = PollerManager::new(1).unwrap();
        mgr.register_context(Kd::Ctrl).unwrap();
        mgr.register_context(Kd::Data).unwrap();
        mgr.end_registrations(2).unwrap();

        let ctrl = mgr.get(Kd::Ctrl).unwrap();
        let data = mgr.get(Kd::Data).unwrap();

        let raw = Canned(RefCell::new(VecDeque::from(vec![
            Wc(p.pack(Kd::Data, 0, 1).unwrap()),
            Wc(p.pack(Kd::Ctrl, 0, 1).unwrap()),
            Wc(p.pack(Kd::Data, 0, 2).unwrap()),
        ])));

        let mut out = Vec::with_capacity(8);
        // Ctrl drains the raw queue first; it should only see its own entry,
        // and both Data entries should land in Data's holdover in order.
        assert!(ctrl.poll_into(&mut out, &raw).unwrap());
        assert_eq!(out, vec![Wc(p.pack(Kd::Ctrl, 0, 1).unwrap())]);

        let mut out2 = Vec::with_capacity(8);
        assert!(data.poll_into(&mut out2, &raw).unwrap());
        assert_eq!(
            out2,
            vec![
                Wc(p.pack(Kd::Data, 0, 1).unwrap()),
                Wc(p.pack(Kd::Data, 0, 2).unwrap()),
            ]
        );
    }

    #[test]
    fn no_completion_is_dropped_or_duplicated() {
        let p = packer();
        let mut mgr: PollerManager<Kd, Wc> = PollerManager::new(1).unwrap();
        mgr.register_context(Kd::Ctrl).unwrap();
        mgr.register_context(Kd::Data).unwrap();
        mgr.end_registrations(2).unwrap();

        let ctrl = mgr.get(Kd::Ctrl).unwrap();
        let data = mgr.get(Kd::Data).unwrap();

        let mut expected_ctrl = 0;
        let mut expected_data = 0;
        let mut input = VecDeque::new();
        for i in 0..20u64 {
            let kind = if i % 3 == 0 { Kd::Ctrl } else { Kd::Data };
            if kind == Kd::Ctrl {
                expected_ctrl += 1;
            } else {
                expected_data += 1;
            }
            input.push_back(Wc(p.pack(kind, 0, i).unwrap()));
        }
        let raw = Canned(RefCell::new(input));

        let mut seen_ctrl = 0;
        let mut seen_data = 0;
        let mut buf = Vec::with_capacity(4);
        loop {
            let a = ctrl.poll_into(&mut buf, &raw).unwrap_or(false);
            seen_ctrl += buf.len();
            let b = data.poll_into(&mut buf, &raw).unwrap_or(false);
            seen_data += buf.len();
            if !a && !b {
                break;
            }
        }

        assert_eq!(seen_ctrl, expected_ctrl);
        assert_eq!(seen_data, expected_data);
    }
}
