//! Configuration of the fan-out and its upstreams.

use std::cmp;
use std::time::Duration;

use domain::base::Name;

//------------ Configuration Constants ----------------------------------------

/// Limits for the number of failed attempts before giving up on an upstream.
const MAX_FAIL_COUNT: DefMinMax<u32> = DefMinMax::new(2, 0, 100);

/// Limits for the time an idle connection is kept in the pool.
const EXPIRE: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(10),
    Duration::from_millis(1),
    Duration::from_secs(3600),
);

/// Limits for the overall deadline of a single query.
const TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(30),
    Duration::from_millis(1),
    Duration::from_secs(300),
);

/// Limits for the read and write timeouts of an upstream exchange.
const IO_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(2),
    Duration::from_millis(1),
    Duration::from_secs(60),
);

/// Limits for the lower bound of the adaptive dial timeout.
const MIN_DIAL_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(1),
    Duration::from_millis(1),
    Duration::from_secs(60),
);

/// Limits for the upper bound of the adaptive dial timeout.
const MAX_DIAL_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(30),
    Duration::from_millis(1),
    Duration::from_secs(300),
);

/// Limits for the interval of background health checks.
const HEALTH_CHECK_INTERVAL: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_millis(500),
    Duration::from_millis(10),
    Duration::from_secs(3600),
);

/// Read and write timeout of a health check probe.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

//------------ Config ---------------------------------------------------------

/// Configuration of a [`Fanout`][crate::fanout::Fanout].
///
/// All setters clamp their argument into a sane range.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of failed attempts after which an upstream is given up on.
    max_fail_count: u32,

    /// Time an idle pooled connection is kept.
    expire: Duration,

    /// Deadline for resolving a single query.
    timeout: Duration,

    /// Interval of background health checks, if they are enabled.
    health_check_interval: Option<Duration>,

    /// Per-exchange timeouts and dial bounds handed to the upstreams.
    upstream: UpstreamConfig,

    /// Only queries at or below this name are handled.
    from: Name<Vec<u8>>,

    /// Queries at or below these names are not handled.
    ignored: Vec<Name<Vec<u8>>>,
}

impl Config {
    /// Creates a new config with default values.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns how many failed attempts an upstream gets per query.
    ///
    /// An upstream is tried at most `max_fail_count + 1` times.
    pub fn max_fail_count(&self) -> u32 {
        self.max_fail_count
    }

    /// Sets the number of failed attempts.
    pub fn set_max_fail_count(&mut self, value: u32) {
        self.max_fail_count = MAX_FAIL_COUNT.limit(value)
    }

    /// Returns how long idle connections are kept in the pool.
    pub fn expire(&self) -> Duration {
        self.expire
    }

    /// Sets how long idle connections are kept in the pool.
    pub fn set_expire(&mut self, value: Duration) {
        self.expire = EXPIRE.limit(value)
    }

    /// Returns the deadline for resolving a single query.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sets the deadline for resolving a single query.
    pub fn set_timeout(&mut self, value: Duration) {
        self.timeout = TIMEOUT.limit(value)
    }

    /// Returns the interval of background health checks.
    ///
    /// Every upstream is probed at this interval in addition to the checks
    /// made between retries. `None` means there are no background checks.
    pub fn health_check_interval(&self) -> Option<Duration> {
        self.health_check_interval
    }

    /// Sets the interval of background health checks.
    pub fn set_health_check_interval(&mut self, value: Option<Duration>) {
        self.health_check_interval =
            value.map(|value| HEALTH_CHECK_INTERVAL.limit(value))
    }

    /// Returns the upstream configuration.
    pub fn upstream(&self) -> &UpstreamConfig {
        &self.upstream
    }

    /// Returns a mutable reference to the upstream configuration.
    pub fn upstream_mut(&mut self) -> &mut UpstreamConfig {
        &mut self.upstream
    }

    /// Returns the zone handled by the fan-out.
    pub fn from(&self) -> &Name<Vec<u8>> {
        &self.from
    }

    /// Sets the zone handled by the fan-out.
    pub fn set_from(&mut self, from: Name<Vec<u8>>) {
        self.from = from
    }

    /// Returns the zones excluded from the fan-out.
    pub fn ignored(&self) -> &[Name<Vec<u8>>] {
        &self.ignored
    }

    /// Adds a zone excluded from the fan-out.
    pub fn add_ignored(&mut self, name: Name<Vec<u8>>) {
        self.ignored.push(name)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_fail_count: MAX_FAIL_COUNT.default(),
            expire: EXPIRE.default(),
            timeout: TIMEOUT.default(),
            health_check_interval: Some(HEALTH_CHECK_INTERVAL.default()),
            upstream: UpstreamConfig::default(),
            from: Name::root_vec(),
            ignored: Vec::new(),
        }
    }
}

//------------ UpstreamConfig -------------------------------------------------

/// Timeouts used by a single upstream.
#[derive(Clone, Copy, Debug)]
pub struct UpstreamConfig {
    /// Timeout for writing a request.
    write_timeout: Duration,

    /// Timeout for reading the matching response.
    read_timeout: Duration,

    /// Lower bound of the adaptive dial timeout.
    min_dial_timeout: Duration,

    /// Upper bound of the adaptive dial timeout.
    max_dial_timeout: Duration,
}

impl UpstreamConfig {
    /// Creates a new config with default values.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the write timeout.
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Sets the write timeout.
    pub fn set_write_timeout(&mut self, value: Duration) {
        self.write_timeout = IO_TIMEOUT.limit(value)
    }

    /// Returns the read timeout.
    ///
    /// The timeout covers reading until a response with the id of the
    /// request arrived, not each single read.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Sets the read timeout.
    pub fn set_read_timeout(&mut self, value: Duration) {
        self.read_timeout = IO_TIMEOUT.limit(value)
    }

    /// Returns the lower bound of the dial timeout.
    pub fn min_dial_timeout(&self) -> Duration {
        self.min_dial_timeout
    }

    /// Returns the upper bound of the dial timeout.
    pub fn max_dial_timeout(&self) -> Duration {
        self.max_dial_timeout
    }

    /// Sets the bounds of the dial timeout.
    ///
    /// If `min` is larger than `max`, both are set to `max`.
    pub fn set_dial_timeout(&mut self, min: Duration, max: Duration) {
        self.max_dial_timeout = MAX_DIAL_TIMEOUT.limit(max);
        self.min_dial_timeout =
            cmp::min(MIN_DIAL_TIMEOUT.limit(min), self.max_dial_timeout);
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            write_timeout: IO_TIMEOUT.default(),
            read_timeout: IO_TIMEOUT.default(),
            min_dial_timeout: MIN_DIAL_TIMEOUT.default(),
            max_dial_timeout: MAX_DIAL_TIMEOUT.default(),
        }
    }
}

//------------ DefMinMax -----------------------------------------------------

/// The default, minimum, and maximum values for a config variable.
#[derive(Clone, Copy)]
pub(crate) struct DefMinMax<T> {
    /// The default value,
    def: T,

    /// The minimum value,
    min: T,

    /// The maximum value,
    max: T,
}

impl<T> DefMinMax<T> {
    /// Creates a new value.
    pub(crate) const fn new(def: T, min: T, max: T) -> Self {
        Self { def, min, max }
    }

    /// Returns the default value.
    pub(crate) fn default(self) -> T {
        self.def
    }

    /// Trims the given value to fit into the minimum/maximum range.
    pub(crate) fn limit(self, value: T) -> T
    where
        T: Ord,
    {
        cmp::max(self.min, cmp::min(self.max, value))
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new();
        assert_eq!(config.max_fail_count(), 2);
        assert_eq!(config.expire(), Duration::from_secs(10));
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(
            config.health_check_interval(),
            Some(Duration::from_millis(500))
        );
        assert_eq!(config.upstream().min_dial_timeout(), Duration::from_secs(1));
        assert_eq!(
            config.upstream().max_dial_timeout(),
            Duration::from_secs(30)
        );
        assert!(config.from().is_root());
        assert!(config.ignored().is_empty());
    }

    #[test]
    fn setters_clamp() {
        let mut config = Config::new();
        config.set_max_fail_count(1000);
        assert_eq!(config.max_fail_count(), 100);
        config.set_expire(Duration::ZERO);
        assert_eq!(config.expire(), Duration::from_millis(1));
        config.set_health_check_interval(Some(Duration::ZERO));
        assert_eq!(
            config.health_check_interval(),
            Some(Duration::from_millis(10))
        );
        config.set_health_check_interval(None);
        assert_eq!(config.health_check_interval(), None);

        let upstream = config.upstream_mut();
        upstream.set_dial_timeout(
            Duration::from_secs(20),
            Duration::from_secs(5),
        );
        assert_eq!(upstream.min_dial_timeout(), Duration::from_secs(5));
        assert_eq!(upstream.max_dial_timeout(), Duration::from_secs(5));
    }
}
