//! Byte-stream filters between the telnet socket and the session buffer.
//!
//! Two stateful stages, both tolerant of sequences split across reads:
//!
//! 1. [`TelnetParser`] removes IAC negotiation from the inbound stream and
//!    produces the refusal replies that keep the peer in plain NVT mode.
//! 2. [`TextCleaner`] strips ANSI CSI/OSC sequences, normalizes `\r\n` and
//!    bare `\r` to `\n`, and decodes UTF-8 with a carry for chunk-split
//!    characters.

// Telnet command bytes (RFC 854/855).
const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

// ─── Telnet negotiation ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TelnetState {
    Data,
    Iac,
    /// Awaiting the option byte of DO/DONT/WILL/WONT.
    Option(u8),
    Subnegotiation,
    SubnegotiationIac,
}

/// Incremental telnet stream parser.
///
/// All options are refused (DO → WONT, WILL → DONT), which is the correct
/// posture for a dumb console client: GNS3 console servers fall back to
/// plain character mode.
#[derive(Debug)]
pub struct TelnetParser {
    state: TelnetState,
}

impl TelnetParser {
    pub fn new() -> Self {
        Self {
            state: TelnetState::Data,
        }
    }

    /// Feed raw socket bytes; appends payload bytes to `data` and any
    /// negotiation replies to `replies`.
    pub fn push(&mut self, input: &[u8], data: &mut Vec<u8>, replies: &mut Vec<u8>) {
        for &b in input {
            self.state = match self.state {
                TelnetState::Data => {
                    if b == IAC {
                        TelnetState::Iac
                    } else {
                        data.push(b);
                        TelnetState::Data
                    }
                }
                TelnetState::Iac => match b {
                    IAC => {
                        // Escaped 0xff data byte.
                        data.push(IAC);
                        TelnetState::Data
                    }
                    SB => TelnetState::Subnegotiation,
                    DO | DONT | WILL | WONT => TelnetState::Option(b),
                    // NOP, GA, and friends carry no option byte.
                    _ => TelnetState::Data,
                },
                TelnetState::Option(cmd) => {
                    match cmd {
                        DO => replies.extend_from_slice(&[IAC, WONT, b]),
                        WILL => replies.extend_from_slice(&[IAC, DONT, b]),
                        // DONT/WONT acknowledge our refusals; nothing to say.
                        _ => {}
                    }
                    TelnetState::Data
                }
                TelnetState::Subnegotiation => {
                    if b == IAC {
                        TelnetState::SubnegotiationIac
                    } else {
                        TelnetState::Subnegotiation
                    }
                }
                TelnetState::SubnegotiationIac => match b {
                    SE => TelnetState::Data,
                    // Escaped IAC inside subnegotiation data.
                    _ => TelnetState::Subnegotiation,
                },
            };
        }
    }
}

impl Default for TelnetParser {
    fn default() -> Self {
        Self::new()
    }
}

// ─── ANSI / line-ending cleanup ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanState {
    Text,
    Escape,
    Csi,
    Osc,
    OscEscape,
}

/// Incremental text cleaner: ANSI strip + line-ending normalization +
/// chunk-safe UTF-8 decode.
#[derive(Debug)]
pub struct TextCleaner {
    state: CleanState,
    pending_cr: bool,
    utf8_carry: Vec<u8>,
}

impl TextCleaner {
    pub fn new() -> Self {
        Self {
            state: CleanState::Text,
            pending_cr: false,
            utf8_carry: Vec::new(),
        }
    }

    pub fn push(&mut self, input: &[u8]) -> String {
        let mut out = std::mem::take(&mut self.utf8_carry);
        out.reserve(input.len());

        for &b in input {
            self.state = match self.state {
                CleanState::Text => match b {
                    ESC => CleanState::Escape,
                    b'\r' => {
                        if self.pending_cr {
                            out.push(b'\n');
                        }
                        self.pending_cr = true;
                        CleanState::Text
                    }
                    b'\n' => {
                        out.push(b'\n');
                        self.pending_cr = false;
                        CleanState::Text
                    }
                    _ => {
                        if self.pending_cr {
                            out.push(b'\n');
                            self.pending_cr = false;
                        }
                        out.push(b);
                        CleanState::Text
                    }
                },
                CleanState::Escape => match b {
                    b'[' => CleanState::Csi,
                    b']' => CleanState::Osc,
                    // Two-byte escape (charset selection etc.) — drop both.
                    _ => CleanState::Text,
                },
                CleanState::Csi => {
                    // Parameter/intermediate bytes run 0x20..0x3f; a final
                    // byte in 0x40..0x7e closes the sequence.
                    if (0x40..=0x7e).contains(&b) {
                        CleanState::Text
                    } else {
                        CleanState::Csi
                    }
                }
                CleanState::Osc => match b {
                    BEL => CleanState::Text,
                    ESC => CleanState::OscEscape,
                    _ => CleanState::Osc,
                },
                CleanState::OscEscape => {
                    // ESC \ is the ST terminator; anything else stays in OSC.
                    if b == b'\\' {
                        CleanState::Text
                    } else {
                        CleanState::Osc
                    }
                }
            };
        }

        // Hold back an incomplete trailing multibyte character.
        let cut = complete_utf8_prefix(&out);
        self.utf8_carry = out.split_off(cut);
        String::from_utf8_lossy(&out).into_owned()
    }
}

impl Default for TextCleaner {
    fn default() -> Self {
        Self::new()
    }
}

/// Length of the longest prefix of `bytes` that does not end inside a
/// multibyte UTF-8 character.
fn complete_utf8_prefix(bytes: &[u8]) -> usize {
    let len = bytes.len();
    // A multibyte sequence is at most 4 bytes; look back at most 3.
    for back in 1..=3.min(len) {
        let b = bytes[len - back];
        if b & 0b1100_0000 == 0b1100_0000 {
            // Lead byte: complete iff its declared width fits.
            let width = if b >= 0xf0 {
                4
            } else if b >= 0xe0 {
                3
            } else {
                2
            };
            return if width == back { len } else { len - back };
        }
        if b & 0b1000_0000 == 0 {
            // ASCII: everything up to here is complete.
            return len;
        }
        // Continuation byte — keep looking back.
    }
    len
}
