//! Scripted transport for driving protocol sequences in tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::transport::{Parity, Transport};
use crate::{Error, Result};

/// Shared transcript of everything the core did to the line.
#[derive(Default)]
pub(crate) struct MockState {
    pub reads: VecDeque<Vec<u8>>,
    pub writes: Vec<u8>,
    pub bauds: Vec<u32>,
    pub parities: Vec<Parity>,
    pub now: u32,
}

/// Replays canned target responses and records writes, baud and parity
/// changes. The returned handle stays valid after the transport has been
/// boxed away into a session.
pub(crate) struct MockTransport {
    state: Rc<RefCell<MockState>>,
}

impl MockTransport {
    pub fn new() -> (Self, Rc<RefCell<MockState>>) {
        let state = Rc::new(RefCell::new(MockState::default()));
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

/// Queue one chunk the next `read` call will return.
pub(crate) fn queue_read(state: &Rc<RefCell<MockState>>, bytes: Vec<u8>) {
    state.borrow_mut().reads.push_back(bytes);
}

impl Transport for MockTransport {
    fn set_baudrate(&mut self, baudrate: u32) -> Result<()> {
        self.state.borrow_mut().bauds.push(baudrate);
        Ok(())
    }

    fn set_parity(&mut self, parity: Parity) -> Result<()> {
        self.state.borrow_mut().parities.push(parity);
        Ok(())
    }

    fn write(&mut self, data: &[u8], _timeout_ms: u32) -> Result<usize> {
        self.state.borrow_mut().writes.extend_from_slice(data);
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        let mut state = self.state.borrow_mut();
        state.now = state.now.wrapping_add(1);
        match state.reads.pop_front() {
            Some(mut chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    chunk.drain(..n);
                    state.reads.push_front(chunk);
                }
                Ok(n)
            }
            None => {
                // Nothing scripted: let the deadline lapse.
                state.now = state.now.wrapping_add(timeout_ms);
                Err(Error::Timeout)
            }
        }
    }

    fn flush(&mut self) {}

    fn delay_ms(&mut self, ms: u32) {
        let mut state = self.state.borrow_mut();
        state.now = state.now.wrapping_add(ms);
    }

    fn tick_ms(&mut self) -> u32 {
        self.state.borrow().now
    }
}
