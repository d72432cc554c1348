//! RFC 854 telnet option auto-refusal
//!
//! When telnet mode is on, bytes arriving from the network pass through
//! a [`Negotiator`] before being forwarded. Every negotiated option is
//! refused: WILL/WONT are answered with DONT, DO/DONT with WONT. The
//! negotiation triplets themselves are consumed instead of being copied
//! to local output, and state is kept across reads so a sequence split
//! over two buffers still parses without reading past either one.

/// Interpret-As-Command introducer byte
pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    SawIac,
    SawRequest(u8),
}

/// Streaming negotiation scanner
#[derive(Debug)]
pub struct Negotiator {
    state: State,
}

impl Negotiator {
    pub fn new() -> Self {
        Self { state: State::Data }
    }

    /// Scan one network read. Returns the bytes to forward to local
    /// output and the refusal replies to send back to the peer.
    pub fn feed(&mut self, input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut data = Vec::with_capacity(input.len());
        let mut replies = Vec::new();

        for &b in input {
            match self.state {
                State::Data => {
                    if b == IAC {
                        self.state = State::SawIac;
                    } else {
                        data.push(b);
                    }
                }
                State::SawIac => match b {
                    // Escaped 0xff is literal data.
                    IAC => {
                        data.push(IAC);
                        self.state = State::Data;
                    }
                    WILL | WONT | DO | DONT => {
                        self.state = State::SawRequest(b);
                    }
                    // Other commands carry no option byte; swallow them.
                    _ => {
                        self.state = State::Data;
                    }
                },
                State::SawRequest(request) => {
                    let refusal = match request {
                        WILL | WONT => DONT,
                        _ => WONT,
                    };
                    replies.extend_from_slice(&[IAC, refusal, b]);
                    self.state = State::Data;
                }
            }
        }

        (data, replies)
    }
}

impl Default for Negotiator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_will_answered_with_dont() {
        let mut neg = Negotiator::new();
        let (data, replies) = neg.feed(&[IAC, WILL, 1]);
        assert!(data.is_empty());
        assert_eq!(replies, vec![IAC, DONT, 1]);
    }

    #[test]
    fn test_do_answered_with_wont() {
        let mut neg = Negotiator::new();
        let (data, replies) = neg.feed(&[IAC, DO, 31]);
        assert!(data.is_empty());
        assert_eq!(replies, vec![IAC, WONT, 31]);
    }

    #[test]
    fn test_wont_and_dont_refused() {
        let mut neg = Negotiator::new();
        let (_, replies) = neg.feed(&[IAC, WONT, 3, IAC, DONT, 5]);
        assert_eq!(replies, vec![IAC, DONT, 3, IAC, WONT, 5]);
    }

    #[test]
    fn test_plain_data_passes_through() {
        let mut neg = Negotiator::new();
        let (data, replies) = neg.feed(b"hello");
        assert_eq!(data, b"hello");
        assert!(replies.is_empty());
    }

    #[test]
    fn test_negotiation_interleaved_with_data() {
        let mut neg = Negotiator::new();
        let (data, replies) = neg.feed(&[b'a', IAC, WILL, 1, b'b']);
        assert_eq!(data, b"ab");
        assert_eq!(replies, vec![IAC, DONT, 1]);
    }

    #[test]
    fn test_truncated_sequence_carries_over() {
        let mut neg = Negotiator::new();
        let (data, replies) = neg.feed(&[b'x', IAC]);
        assert_eq!(data, b"x");
        assert!(replies.is_empty());

        let (data, replies) = neg.feed(&[WILL]);
        assert!(data.is_empty());
        assert!(replies.is_empty());

        let (data, replies) = neg.feed(&[24, b'y']);
        assert_eq!(data, b"y");
        assert_eq!(replies, vec![IAC, DONT, 24]);
    }

    #[test]
    fn test_escaped_iac_is_literal() {
        let mut neg = Negotiator::new();
        let (data, replies) = neg.feed(&[IAC, IAC, b'z']);
        assert_eq!(data, vec![IAC, b'z']);
        assert!(replies.is_empty());
    }
}
