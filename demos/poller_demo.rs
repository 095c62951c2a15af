//! Demonstrates splitting one synthetic completion stream into two
//! independent per-kind consumers with the contexted poller, without
//! touching an RDMA device.

use std::cell::RefCell;
use std::collections::VecDeque;

use conn_core::codec::{Kind, Packer};
use conn_core::poller::{HasWrId, PollerManager, RawPoller};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Traffic {
    Control,
    Data,
}

impl Kind for Traffic {
    const MAX_ORDINAL: u64 = 1;

    fn ordinal(&self) -> u64 {
        match self {
            Traffic::Control => 0,
            Traffic::Data => 1,
        }
    }

    fn from_ordinal(ordinal: u64) -> Self {
        match ordinal {
            0 => Traffic::Control,
            1 => Traffic::Data,
            other => panic!("unknown traffic kind ordinal {}", other),
        }
    }
}

#[derive(Debug, Clone)]
struct Completion(u64);

impl HasWrId for Completion {
    fn wr_id(&self) -> u64 {
        self.0
    }
}

struct SyntheticQueue(RefCell<VecDeque<Completion>>);

impl RawPoller<Completion> for SyntheticQueue {
    fn poll_raw(&self, out: &mut Vec<Completion>, capacity: usize) -> conn_core::Result<()> {
        let mut queue = self.0.borrow_mut();
        for _ in 0..capacity {
            match queue.pop_front() {
                Some(wc) => out.push(wc),
                None => break,
            }
        }
        Ok(())
    }
}

fn main() -> conn_core::Result<()> {
    env_logger::init();

    let packer: Packer<Traffic> = Packer::new(8)?;

    let mut manager: PollerManager<Traffic, Completion> = PollerManager::new(8)?;
    manager.register_context(Traffic::Control)?;
    manager.register_context(Traffic::Data)?;
    manager.end_registrations(2)?;

    let control = manager.get(Traffic::Control)?;
    let data = manager.get(Traffic::Data)?;

    let mut raw = VecDeque::new();
    for seq in 0..10u64 {
        let kind = if seq % 4 == 0 {
            Traffic::Control
        } else {
            Traffic::Data
        };
        raw.push_back(Completion(packer.pack(kind, 0, seq).unwrap()));
    }
    let queue = SyntheticQueue(RefCell::new(raw));

    let mut control_buf = Vec::with_capacity(4);
    let mut data_buf = Vec::with_capacity(4);
    let mut control_seen = Vec::new();
    let mut data_seen = Vec::new();

    loop {
        let got_control = control.poll_into(&mut control_buf, &queue)?;
        control_seen.extend(control_buf.iter().map(|c| c.0));
        let got_data = data.poll_into(&mut data_buf, &queue)?;
        data_seen.extend(data_buf.iter().map(|c| c.0));
        if !got_control && !got_data {
            break;
        }
    }

    println!("control stream saw {} completions", control_seen.len());
    println!("data stream saw {} completions", data_seen.len());
    Ok(())
}
