//! robots.txt parsing and directive lookup.
//!
//! The reader contract is fail-open: a missing or unfetchable
//! robots.txt means "allow, no delay override". Only an explicit
//! disallow or crawl-delay changes behavior.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

/// The answer a worker needs before fetching from a domain.
#[derive(Debug, Clone, PartialEq)]
pub struct RobotsDirectives {
    /// Whether fetching the requested path is allowed at all.
    pub allowed: bool,
    /// Crawl-delay for our agent (agent-specific beats wildcard).
    pub crawl_delay: Option<Duration>,
}

impl RobotsDirectives {
    /// Fail-open default: allowed, no delay override.
    pub fn permissive() -> Self {
        Self {
            allowed: true,
            crawl_delay: None,
        }
    }
}

/// Per-agent directive group as parsed from robots.txt.
#[derive(Debug, Clone, Default)]
struct AgentGroup {
    disallow: Vec<String>,
    allow: Vec<String>,
    crawl_delay: Option<f64>,
}

/// Parsed robots.txt rules for one domain.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    /// Groups keyed by lowercased user-agent token.
    groups: HashMap<String, AgentGroup>,
    /// The wildcard (`*`) group.
    wildcard: AgentGroup,
}

impl RobotsRules {
    /// Parse robots.txt content. Unknown directives are ignored.
    pub fn parse(content: &str) -> Self {
        let mut rules = Self::default();
        let mut pending_agents: Vec<String> = Vec::new();
        let mut group = AgentGroup::default();
        let mut in_group_body = false;

        let flush = |agents: &mut Vec<String>, group: &mut AgentGroup, rules: &mut Self| {
            for agent in agents.drain(..) {
                if agent == "*" {
                    rules.wildcard = group.clone();
                } else {
                    rules.groups.insert(agent, group.clone());
                }
            }
            *group = AgentGroup::default();
        };

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match directive.trim().to_ascii_lowercase().as_str() {
                "user-agent" => {
                    // A user-agent line after rule lines starts a new group.
                    if in_group_body {
                        flush(&mut pending_agents, &mut group, &mut rules);
                        in_group_body = false;
                    }
                    pending_agents.push(value.to_ascii_lowercase());
                }
                "disallow" => {
                    in_group_body = true;
                    if !value.is_empty() {
                        group.disallow.push(value.to_string());
                    }
                }
                "allow" => {
                    in_group_body = true;
                    if !value.is_empty() {
                        group.allow.push(value.to_string());
                    }
                }
                "crawl-delay" => {
                    in_group_body = true;
                    if let Ok(secs) = value.parse::<f64>() {
                        if secs.is_finite() && secs >= 0.0 {
                            group.crawl_delay = Some(secs);
                        }
                    }
                }
                _ => {}
            }
        }
        flush(&mut pending_agents, &mut group, &mut rules);

        rules
    }

    fn group_for(&self, user_agent: &str) -> &AgentGroup {
        let agent = user_agent.to_ascii_lowercase();
        self.groups
            .get(&agent)
            .or_else(|| {
                self.groups
                    .iter()
                    .find(|(token, _)| agent.contains(token.as_str()))
                    .map(|(_, g)| g)
            })
            .unwrap_or(&self.wildcard)
    }

    /// Whether fetching `path` is allowed for `user_agent`.
    /// Allow prefixes override disallow prefixes.
    pub fn is_allowed(&self, user_agent: &str, path: &str) -> bool {
        let group = self.group_for(user_agent);

        if group.allow.iter().any(|p| path.starts_with(p)) {
            return true;
        }
        !group.disallow.iter().any(|p| path.starts_with(p))
    }

    /// Crawl-delay for `user_agent`, falling back to the wildcard group.
    pub fn crawl_delay(&self, user_agent: &str) -> Option<Duration> {
        self.group_for(user_agent)
            .crawl_delay
            .or(self.wildcard.crawl_delay)
            .map(Duration::from_secs_f64)
    }

    /// Directives for one path, collapsed to what the dispatcher needs.
    pub fn directives(&self, user_agent: &str, path: &str) -> RobotsDirectives {
        RobotsDirectives {
            allowed: self.is_allowed(user_agent, path),
            crawl_delay: self.crawl_delay(user_agent),
        }
    }
}

/// Source of robots directives for a domain.
///
/// Implementations must fail open: fetch errors and 404s return
/// [`RobotsDirectives::permissive`], never an error.
#[async_trait]
pub trait RobotsReader: Send + Sync {
    async fn directives(&self, domain: &str, path: &str) -> RobotsDirectives;
}

/// HTTP-backed robots reader.
pub struct HttpRobotsReader {
    client: reqwest::Client,
    user_agent: String,
}

impl HttpRobotsReader {
    pub fn new(client: reqwest::Client, user_agent: impl Into<String>) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
        }
    }
}

#[async_trait]
impl RobotsReader for HttpRobotsReader {
    async fn directives(&self, domain: &str, path: &str) -> RobotsDirectives {
        let url = format!("https://{}/robots.txt", domain.trim_end_matches('/'));

        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => RobotsRules::parse(&body).directives(&self.user_agent, path),
                Err(e) => {
                    tracing::debug!(domain = %domain, error = %e, "robots body unreadable, failing open");
                    RobotsDirectives::permissive()
                }
            },
            Ok(response) => {
                tracing::debug!(domain = %domain, status = %response.status(), "no robots.txt, failing open");
                RobotsDirectives::permissive()
            }
            Err(e) => {
                tracing::debug!(domain = %domain, error = %e, "robots fetch failed, failing open");
                RobotsDirectives::permissive()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wildcard_group() {
        let rules = RobotsRules::parse(
            r#"
User-agent: *
Disallow: /search/internal/
Allow: /search/internal/open/
Crawl-delay: 3
"#,
        );

        assert!(!rules.is_allowed("fleetbot", "/search/internal/page"));
        assert!(rules.is_allowed("fleetbot", "/search/internal/open/page"));
        assert!(rules.is_allowed("fleetbot", "/listings"));
        assert_eq!(rules.crawl_delay("fleetbot"), Some(Duration::from_secs(3)));
    }

    #[test]
    fn agent_specific_group_beats_wildcard() {
        let rules = RobotsRules::parse(
            r#"
User-agent: *
Crawl-delay: 10
Disallow: /

User-agent: fleetbot
Crawl-delay: 1
Disallow:
"#,
        );

        assert!(rules.is_allowed("fleetbot", "/anything"));
        assert!(!rules.is_allowed("otherbot", "/anything"));
        assert_eq!(rules.crawl_delay("fleetbot"), Some(Duration::from_secs(1)));
        assert_eq!(rules.crawl_delay("otherbot"), Some(Duration::from_secs(10)));
    }

    #[test]
    fn multiple_agents_share_one_group() {
        let rules = RobotsRules::parse(
            r#"
User-agent: alphabot
User-agent: betabot
Disallow: /private/
"#,
        );

        assert!(!rules.is_allowed("alphabot", "/private/x"));
        assert!(!rules.is_allowed("betabot", "/private/x"));
        assert!(rules.is_allowed("gammabot", "/private/x"));
    }

    #[test]
    fn empty_content_is_permissive() {
        let rules = RobotsRules::parse("");
        assert!(rules.is_allowed("anybot", "/any"));
        assert!(rules.crawl_delay("anybot").is_none());
    }

    #[test]
    fn comments_and_junk_are_ignored() {
        let rules = RobotsRules::parse(
            r#"
# fleet crawler rules
User-agent: * # everyone
Disallow: /admin/ # ops only
not-a-directive
Crawl-delay: abc
"#,
        );

        assert!(!rules.is_allowed("bot", "/admin/panel"));
        assert!(rules.crawl_delay("bot").is_none());
    }

    #[test]
    fn fractional_crawl_delay_is_kept() {
        let rules = RobotsRules::parse("User-agent: *\nCrawl-delay: 0.5\n");
        assert_eq!(rules.crawl_delay("bot"), Some(Duration::from_millis(500)));
    }

    #[test]
    fn permissive_directives_allow_with_no_delay() {
        let d = RobotsDirectives::permissive();
        assert!(d.allowed);
        assert!(d.crawl_delay.is_none());
    }
}
