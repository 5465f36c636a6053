//! Node configuration: a plain, validated struct. Parsing it from a
//! file or CLI arguments is explicitly out of scope — that's the
//! embedding application's job.

use std::net::IpAddr;
use std::time::Duration;

use crate::error::*;
use crate::identity::Identity;

/// Node configuration and its validation bounds.
#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub backlog: u32,
    pub timeout: Duration,
    pub reuse_time: Duration,
    /// `0` resolves to 16 when `synchronous` is `false`; `synchronous`
    /// mode hard-requires exactly 1, regardless of what `0` would
    /// otherwise resolve to (`spec.md` §6/§9). `Config::default()`
    /// encodes the resolved value for its own `synchronous: true`
    /// default directly, since this struct has no separate
    /// raw-vs-resolved representation.
    pub max_slots: u8,
    pub synchronous: bool,
    pub disable_signals: bool,
    /// `0` resolves to an implementation default via
    /// `effective_buffer_size` (§6). The original sizes a reusable
    /// per-connection scratch buffer with this; `reader` instead reads
    /// each fixed-length piece of a frame directly via
    /// `AsyncReadExt::read_exact`, which needs no such scratch buffer,
    /// so this field is validated for config-surface compatibility but
    /// does not otherwise affect I/O sizing.
    pub buffer_size: usize,
    pub max_msg_size: u32,
    pub bind_v4: Option<IpAddr>,
    pub bind_v6: Option<IpAddr>,
    pub identity: Identity,
    pub cert_chain_pem: Option<Vec<u8>>,
    pub dh_params_pem: Option<Vec<u8>>,
    pub disable_encryption: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 2998,
            backlog: 100,
            timeout: Duration::from_secs_f64(5.0),
            reuse_time: Duration::from_secs(30),
            // synchronous mode (the default, below) hard-requires 1.
            max_slots: 1,
            synchronous: true,
            disable_signals: false,
            buffer_size: 0,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            bind_v4: None,
            bind_v6: None,
            identity: Identity::ZERO,
            cert_chain_pem: None,
            dh_params_pem: None,
            disable_encryption: false,
        }
    }
}

/// Default `MAX_MSG_SIZE`, chosen generously above any plausible
/// `header_len + data_len` this crate's inline buffers are sized for.
pub const DEFAULT_MAX_MSG_SIZE: u32 = 16 * 1024 * 1024;

/// Minimum buffer size, also the size of the wire scratch buffer; it
/// must be at least as large as a handshake.
pub const MIN_BUFFER_SIZE: usize = 1024;

/// Implementation default `MAX_SLOTS` the `0` sentinel resolves to,
/// when not overridden by `SYNCHRONOUS`'s hard requirement of exactly 1.
pub const DEFAULT_MAX_SLOTS: u8 = 16;

impl Config {
    /// Resolves the `max_slots` sentinel: `0` means "use the
    /// implementation default," which is `DEFAULT_MAX_SLOTS` (16) unless
    /// `synchronous` hard-requires exactly 1. A nonzero value passes
    /// through unchanged (subject to the bounds `validate` enforces).
    pub fn resolved_max_slots(&self) -> u8 {
        if self.max_slots == 0 {
            if self.synchronous { 1 } else { DEFAULT_MAX_SLOTS }
        } else {
            self.max_slots
        }
    }

    /// Validates every configuration bound, returning
    /// `ErrorKind::ValueError` on the first violation.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::wrapped(ErrorKind::ValueError, msg.to_string()));

        if self.port <= 1024 {
            return fail("PORT must be > 1024");
        }
        if self.backlog >= 128 {
            return fail("BACKLOG must be < 128");
        }
        let timeout = self.timeout.as_secs_f64();
        if !(0.1..=60.0).contains(&timeout) {
            return fail("TIMEOUT must be within 0.1..=60 seconds");
        }
        let reuse_time = self.reuse_time.as_secs_f64();
        if !(0.5..=3600.0).contains(&reuse_time) {
            return fail("REUSE_TIME must be within 0.5..=3600 seconds");
        }
        if timeout > reuse_time {
            return fail("TIMEOUT must be <= REUSE_TIME");
        }
        // 0 is the "use the implementation default" sentinel, resolved
        // before the bounds check below; 32 is the hard maximum slot
        // count regardless of SYNCHRONOUS.
        let resolved_slots = self.resolved_max_slots();
        if resolved_slots == 0 || resolved_slots > 32 {
            return fail("MAX_SLOTS must be within 1..=32");
        }
        if self.synchronous && resolved_slots != 1 {
            return fail("MAX_SLOTS must be 1 when SYNCHRONOUS is set");
        }
        if self.buffer_size != 0 && self.buffer_size < MIN_BUFFER_SIZE {
            return fail("BUFFER_SIZE must be 0 (implementation default) or >= 1024");
        }
        if !self.disable_encryption && (self.cert_chain_pem.is_none() || self.dh_params_pem.is_none()) {
            return fail("CERT_CHAIN_PEM and DH_PARAMS_PEM are required unless DISABLE_ENCRYPTION");
        }
        Ok(())
    }

    pub fn effective_buffer_size(&self) -> usize {
        self.buffer_size.max(MIN_BUFFER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config { disable_encryption: true, ..Config::default() }
    }

    #[test]
    fn default_with_encryption_disabled_is_valid() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn port_must_be_above_1024() {
        let mut c = valid();
        c.port = 1024;
        assert_eq!(c.validate().unwrap_err().kind(), ErrorKind::ValueError);
    }

    #[test]
    fn backlog_must_be_below_128() {
        let mut c = valid();
        c.backlog = 128;
        assert!(c.validate().is_err());
    }

    #[test]
    fn synchronous_requires_single_slot() {
        let mut c = valid();
        c.max_slots = 4;
        assert!(c.validate().is_err());
        c.synchronous = false;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn zero_max_slots_resolves_to_default_outside_synchronous_mode() {
        let c = Config { max_slots: 0, synchronous: false, ..valid() };
        assert!(c.validate().is_ok());
        assert_eq!(c.resolved_max_slots(), DEFAULT_MAX_SLOTS);
    }

    #[test]
    fn zero_max_slots_resolves_to_one_in_synchronous_mode() {
        let c = Config { max_slots: 0, synchronous: true, ..valid() };
        assert!(c.validate().is_ok());
        assert_eq!(c.resolved_max_slots(), 1);
    }

    #[test]
    fn max_slots_hard_cap_is_32_not_1() {
        let mut c = valid();
        c.synchronous = false;
        c.max_slots = 32;
        assert!(c.validate().is_ok());
        c.max_slots = 33;
        assert!(c.validate().is_err());
    }

    #[test]
    fn timeout_must_not_exceed_reuse_time() {
        let mut c = valid();
        c.timeout = Duration::from_secs(40);
        c.reuse_time = Duration::from_secs(30);
        assert!(c.validate().is_err());
    }

    #[test]
    fn encryption_requires_cert_material_unless_disabled() {
        let mut c = Config::default();
        c.disable_encryption = false;
        assert!(c.validate().is_err());
        c.cert_chain_pem = Some(vec![1]);
        c.dh_params_pem = Some(vec![2]);
        assert!(c.validate().is_ok());
    }
}
