use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::time::Instant;

use crate::error::CrawlError;

/// Whether matching tasks may be scheduled at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    #[default]
    Allow,
    Deny,
}

/// A destination matcher plus the throttling and quotas applied to it
///
/// Zero values count as unset. At most one of delay/jitter, rate and
/// parallelism may be set on a rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitRule {
    /// Glob over the lower-cased hostname (`*`, `?`, `[abc]`, `{a,b}`)
    pub glob: Option<String>,
    /// Regular expression over the lower-cased hostname
    pub regex: Option<String>,
    pub policy: Policy,
    /// Requests allowed in flight at once
    pub parallelism: Option<usize>,
    /// Requests allowed per second
    pub rate: Option<u32>,
    /// Minimum spacing between two requests
    pub delay_ms: Option<u64>,
    /// Extra random spacing, up to this bound
    pub random_delay_ms: Option<u64>,
    /// Total tasks admitted over the whole run
    pub max_requests: Option<u64>,
    pub max_depth: Option<u32>,
}

impl LimitRule {
    pub fn glob(pattern: &str) -> Self {
        Self {
            glob: Some(pattern.to_string()),
            ..Self::default()
        }
    }

    pub fn regex(pattern: &str) -> Self {
        Self {
            regex: Some(pattern.to_string()),
            ..Self::default()
        }
    }

    pub fn deny(mut self) -> Self {
        self.policy = Policy::Deny;
        self
    }

    pub fn parallelism(mut self, limit: usize) -> Self {
        self.parallelism = Some(limit);
        self
    }

    pub fn rate(mut self, per_second: u32) -> Self {
        self.rate = Some(per_second);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn random_delay(mut self, bound: Duration) -> Self {
        self.random_delay_ms = Some(bound.as_millis() as u64);
        self
    }

    pub fn max_requests(mut self, limit: u64) -> Self {
        self.max_requests = Some(limit);
        self
    }

    pub fn max_depth(mut self, depth: u32) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// Validate the rule and compile its matcher
    pub(crate) fn compile(&self) -> Result<CompiledRule, CrawlError> {
        let (pattern, matcher) = match (&self.glob, &self.regex) {
            (Some(glob), None) => (glob.clone(), glob_to_regex(glob)?),
            (None, Some(regex)) => (regex.clone(), regex.clone()),
            _ => {
                return Err(CrawlError::Config(
                    "a limit rule needs exactly one of glob or regex".to_string(),
                ))
            }
        };
        let matcher = Regex::new(&matcher)
            .map_err(|e| CrawlError::Config(format!("invalid host pattern {:?}: {}", pattern, e)))?;

        let delay = Duration::from_millis(self.delay_ms.unwrap_or(0));
        let jitter = Duration::from_millis(self.random_delay_ms.unwrap_or(0));
        let rate = self.rate.filter(|r| *r > 0);
        let parallelism = self.parallelism.filter(|p| *p > 0);

        let timed = !delay.is_zero() || !jitter.is_zero();
        let disciplines = [timed, rate.is_some(), parallelism.is_some()]
            .iter()
            .filter(|set| **set)
            .count();
        if disciplines > 1 {
            return Err(CrawlError::Config(format!(
                "limit rule {:?} mixes delay, rate and parallelism; pick one",
                pattern
            )));
        }

        let throttle = if timed {
            Throttle::Delay { delay, jitter }
        } else if let Some(rate) = rate {
            Throttle::Rate(rate)
        } else if let Some(limit) = parallelism {
            Throttle::Parallel(Arc::new(Semaphore::new(limit)))
        } else {
            Throttle::Unthrottled
        };

        Ok(CompiledRule {
            pattern,
            matcher,
            policy: self.policy,
            max_depth: self.max_depth.filter(|d| *d > 0),
            state: RuleState::new(self.max_requests.filter(|m| *m > 0), rate.unwrap_or(0)),
            throttle,
        })
    }
}

pub(crate) enum Throttle {
    Delay { delay: Duration, jitter: Duration },
    Rate(u32),
    Parallel(Arc<Semaphore>),
    Unthrottled,
}

pub(crate) struct CompiledRule {
    pub(crate) pattern: String,
    matcher: Regex,
    pub(crate) policy: Policy,
    pub(crate) max_depth: Option<u32>,
    pub(crate) throttle: Throttle,
    pub(crate) state: RuleState,
}

impl CompiledRule {
    pub(crate) fn matches(&self, host: &str) -> bool {
        self.matcher.is_match(host)
    }
}

/// Counters shared by every request matching one rule
pub(crate) struct RuleState {
    requests_left: Option<AtomicU64>,
    tokens: AtomicU32,
    pub(crate) last_dispatch: Mutex<Option<Instant>>,
    refilled: Notify,
}

impl RuleState {
    fn new(max_requests: Option<u64>, rate: u32) -> Self {
        Self {
            requests_left: max_requests.map(AtomicU64::new),
            tokens: AtomicU32::new(rate),
            last_dispatch: Mutex::new(None),
            refilled: Notify::new(),
        }
    }

    /// Consume one unit of the request quota, false once exhausted
    pub(crate) fn take_request(&self) -> bool {
        match &self.requests_left {
            None => true,
            Some(left) => left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok(),
        }
    }

    /// Wait for a rate token and take it
    pub(crate) async fn take_token(&self) {
        loop {
            let refilled = self.refilled.notified();
            tokio::pin!(refilled);
            refilled.as_mut().enable();

            if self
                .tokens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return;
            }
            refilled.await;
        }
    }

    pub(crate) fn refill(&self, cap: u32) {
        self.tokens.store(cap, Ordering::SeqCst);
        self.refilled.notify_waiters();
    }
}

/// Translate a host glob into an anchored regular expression
fn glob_to_regex(glob: &str) -> Result<String, CrawlError> {
    let mut out = String::from("^");
    let mut braces = 0usize;
    let mut chars = glob.chars();

    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '{' => {
                braces += 1;
                out.push_str("(?:");
            }
            '}' if braces > 0 => {
                braces -= 1;
                out.push(')');
            }
            ',' if braces > 0 => out.push('|'),
            '[' => {
                out.push('[');
                let mut first = true;
                let mut closed = false;
                for c in chars.by_ref() {
                    match c {
                        ']' => {
                            closed = true;
                            break;
                        }
                        '!' if first => out.push('^'),
                        '\\' | '[' | '&' | '~' | '^' => {
                            out.push('\\');
                            out.push(c);
                        }
                        c => out.push(c),
                    }
                    first = false;
                }
                if !closed {
                    return Err(CrawlError::Config(format!("unterminated [ in glob {:?}", glob)));
                }
                out.push(']');
            }
            c => out.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }

    if braces > 0 {
        return Err(CrawlError::Config(format!("unterminated {{ in glob {:?}", glob)));
    }
    out.push('$');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(glob: &str) -> Regex {
        Regex::new(&glob_to_regex(glob).unwrap()).unwrap()
    }

    #[test]
    fn test_glob_translation() {
        let re = matcher("*.example.com");
        assert!(re.is_match("www.example.com"));
        assert!(!re.is_match("example.com"));
        assert!(!re.is_match("www.example.com.evil.org"));

        let re = matcher("{api,www}.example.?om");
        assert!(re.is_match("api.example.com"));
        assert!(re.is_match("www.example.zom"));
        assert!(!re.is_match("cdn.example.com"));

        let re = matcher("host[0-9].lan");
        assert!(re.is_match("host7.lan"));
        assert!(!re.is_match("hostx.lan"));

        let re = matcher("[!a]*");
        assert!(re.is_match("b.org"));
        assert!(!re.is_match("a.org"));

        assert!(glob_to_regex("host[0-9").is_err());
        assert!(glob_to_regex("{a,b").is_err());
    }

    #[test]
    fn test_rule_validation() {
        assert!(LimitRule::default().compile().is_err());

        let both = LimitRule {
            glob: Some("*".to_string()),
            regex: Some(".*".to_string()),
            ..LimitRule::default()
        };
        assert!(both.compile().is_err());

        let mixed = LimitRule::glob("*").rate(2).delay(Duration::from_secs(1));
        assert!(matches!(mixed.compile(), Err(CrawlError::Config(_))));

        let mixed = LimitRule::glob("*").parallelism(2).random_delay(Duration::from_millis(10));
        assert!(mixed.compile().is_err());

        assert!(LimitRule::regex("(unclosed").compile().is_err());

        let rule = LimitRule::glob("*").rate(0).parallelism(3).compile().unwrap();
        assert!(matches!(rule.throttle, Throttle::Parallel(_)));
    }

    #[test]
    fn test_request_quota() {
        let rule = LimitRule::regex("example").max_requests(2).compile().unwrap();
        assert!(rule.matches("www.example.com"));
        assert!(rule.state.take_request());
        assert!(rule.state.take_request());
        assert!(!rule.state.take_request());
    }

    #[test]
    fn test_tokens_wait_for_refill() {
        let rule = LimitRule::glob("*").rate(1).compile().unwrap();

        let mut first = tokio_test::task::spawn(rule.state.take_token());
        tokio_test::assert_ready!(first.poll());

        let mut second = tokio_test::task::spawn(rule.state.take_token());
        tokio_test::assert_pending!(second.poll());

        rule.state.refill(1);
        assert!(second.is_woken());
        tokio_test::assert_ready!(second.poll());
    }
}
