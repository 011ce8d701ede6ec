//! Chaining stream: a lazily generated sequence of component streams read as one
//!
//! A [`ChainElements`] implementation produces the next component given the
//! previous one; [`ChainingInputStream`] handles everything else: advancing on
//! EOF, skip fallback, mark/reset across components, and closing every
//! component it obtained exactly once.
//!
//! The stream is single-owner. All operations take `&mut self`; sharing one
//! instance across threads requires external synchronization.

use std::io::{self, Read};
use std::mem;

use tracing::debug;

use crate::error::CryptoError;
use crate::stream::InputStream;

/// Generator of the component streams of a [`ChainingInputStream`].
pub trait ChainElements {
    type Element: InputStream;

    /// Whether the previous components must still be produced and closed
    /// when the chain is closed early. Chains whose components own nothing
    /// beyond memory turn this off.
    const DRAIN_ON_CLOSE: bool = true;

    /// Produce the component following `previous` (`None` at the start), or
    /// `None` when the chain is over. `previous` has already been closed
    /// unless it is held for a mark.
    fn next_element(&mut self, previous: Option<&Self::Element>)
        -> io::Result<Option<Self::Element>>;

    /// Every component of a chain that supports mark must support mark itself.
    fn mark_supported(&self) -> bool {
        false
    }

    /// Called after the chain recorded a mark, with the caller's read limit.
    fn on_mark(&mut self, read_limit: usize) {
        let _ = read_limit;
    }

    /// Called after the chain moved back to its mark.
    fn on_reset(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Called once, after all components are closed.
    fn on_close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Head<E> {
    Start,
    Active(E),
    Exhausted,
}

enum Mark<E> {
    Unset,
    Start,
    /// The marked component is the active one.
    Current,
    /// The marked component is behind the active one and kept open.
    Detached(E),
    Exhausted,
}

pub struct ChainingInputStream<G: ChainElements> {
    elements: G,
    head: Head<G::Element>,
    mark: Mark<G::Element>,
    closed: bool,
}

impl<G: ChainElements> ChainingInputStream<G> {
    pub fn new(elements: G) -> Self {
        Self {
            elements,
            head: Head::Start,
            mark: Mark::Unset,
            closed: false,
        }
    }

    pub fn elements(&self) -> &G {
        &self.elements
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(CryptoError::StreamClosed.into());
        }
        Ok(())
    }

    /// Move to the next component. Returns false once the chain is exhausted.
    ///
    /// On failure the chain stays where it was, so a retry asks the generator
    /// for the same component again.
    fn advance(&mut self) -> io::Result<bool> {
        match mem::replace(&mut self.head, Head::Exhausted) {
            Head::Exhausted => Ok(false),
            Head::Start => match self.elements.next_element(None) {
                Ok(next) => Ok(self.install(next)),
                Err(e) => {
                    self.head = Head::Start;
                    Err(e)
                }
            },
            Head::Active(mut previous) => {
                let marked = matches!(self.mark, Mark::Current);
                if !marked {
                    if let Err(e) = previous.close() {
                        self.head = Head::Active(previous);
                        return Err(e);
                    }
                }
                match self.elements.next_element(Some(&previous)) {
                    Ok(next) => {
                        if marked {
                            self.mark = Mark::Detached(previous);
                        }
                        Ok(self.install(next))
                    }
                    Err(e) => {
                        self.head = Head::Active(previous);
                        Err(e)
                    }
                }
            }
        }
    }

    fn install(&mut self, next: Option<G::Element>) -> bool {
        match next {
            Some(mut element) => {
                if self.elements.mark_supported() && !element.mark_supported() {
                    let _ = element.close();
                    panic!("chain supports mark/reset but generated a component that does not");
                }
                self.head = Head::Active(element);
                true
            }
            None => {
                self.head = Head::Exhausted;
                false
            }
        }
    }

    fn close_head_for_reset(&mut self) {
        if let Head::Active(mut current) = mem::replace(&mut self.head, Head::Exhausted) {
            if let Err(e) = current.close() {
                debug!(error = %e, "closing component on reset failed");
            }
        }
    }

    fn drain(&mut self, mut previous: Option<G::Element>, first_err: &mut Option<io::Error>) {
        loop {
            match self.elements.next_element(previous.as_ref()) {
                Ok(Some(mut next)) => {
                    if let Err(e) = next.close() {
                        first_err.get_or_insert(e);
                    }
                    previous = Some(next);
                }
                Ok(None) => break,
                Err(e) => {
                    first_err.get_or_insert(e);
                    break;
                }
            }
        }
    }
}

impl<G: ChainElements> Read for ChainingInputStream<G> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open()?;
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match &mut self.head {
                Head::Exhausted => return Ok(0),
                Head::Start => {
                    self.advance()?;
                }
                Head::Active(element) => {
                    let n = element.read(buf)?;
                    if n > 0 {
                        return Ok(n);
                    }
                    self.advance()?;
                }
            }
        }
    }
}

impl<G: ChainElements> InputStream for ChainingInputStream<G> {
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        self.ensure_open()?;
        let mut remaining = n;
        while remaining > 0 {
            let skipped = match &mut self.head {
                Head::Exhausted => break,
                Head::Start => {
                    self.advance()?;
                    continue;
                }
                Head::Active(element) => element.skip(remaining)?,
            };
            if skipped > 0 {
                remaining -= skipped.min(remaining);
                continue;
            }
            let mut byte = [0u8; 1];
            if self.read(&mut byte)? == 0 {
                break;
            }
            remaining -= 1;
        }
        Ok(n - remaining)
    }

    fn available(&self) -> io::Result<u64> {
        self.ensure_open()?;
        match &self.head {
            Head::Active(element) => element.available(),
            Head::Start | Head::Exhausted => Ok(0),
        }
    }

    fn mark_supported(&self) -> bool {
        self.elements.mark_supported()
    }

    fn mark(&mut self, read_limit: usize) {
        if self.closed || !self.mark_supported() {
            return;
        }
        if let Mark::Detached(mut superseded) = mem::replace(&mut self.mark, Mark::Unset) {
            if let Err(e) = superseded.close() {
                debug!(error = %e, "closing superseded marked component failed");
            }
        }
        self.mark = match &mut self.head {
            Head::Start => Mark::Start,
            Head::Active(element) => {
                element.mark(read_limit);
                Mark::Current
            }
            Head::Exhausted => Mark::Exhausted,
        };
        self.elements.on_mark(read_limit);
    }

    fn reset(&mut self) -> io::Result<()> {
        self.ensure_open()?;
        if !self.mark_supported() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "mark/reset not supported",
            ));
        }
        match mem::replace(&mut self.mark, Mark::Unset) {
            Mark::Unset => {
                return Err(io::Error::new(io::ErrorKind::Other, "mark not set"));
            }
            Mark::Current => {
                self.mark = Mark::Current;
                if let Head::Active(element) = &mut self.head {
                    element.reset()?;
                }
            }
            Mark::Detached(mut element) => {
                self.close_head_for_reset();
                let reset = element.reset();
                self.head = Head::Active(element);
                self.mark = Mark::Current;
                reset?;
            }
            Mark::Start => {
                self.close_head_for_reset();
                self.head = Head::Start;
                self.mark = Mark::Start;
            }
            Mark::Exhausted => {
                self.close_head_for_reset();
                self.mark = Mark::Exhausted;
            }
        }
        self.elements.on_reset()
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_err = None;
        if let Mark::Detached(mut marked) = mem::replace(&mut self.mark, Mark::Unset) {
            if let Err(e) = marked.close() {
                first_err.get_or_insert(e);
            }
        }
        let last = match mem::replace(&mut self.head, Head::Exhausted) {
            Head::Exhausted => None,
            Head::Start => Some(None),
            Head::Active(mut current) => {
                if let Err(e) = current.close() {
                    first_err.get_or_insert(e);
                }
                Some(Some(current))
            }
        };
        if G::DRAIN_ON_CLOSE {
            if let Some(previous) = last {
                self.drain(previous, &mut first_err);
            }
        }
        if let Err(e) = self.elements.on_close() {
            first_err.get_or_insert(e);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<G: ChainElements> Drop for ChainingInputStream<G> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(error = %e, "closing chain on drop failed");
        }
    }
}
