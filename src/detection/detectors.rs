//! Leaf detectors over URL, DOM, and text evidence.

use regex::{Regex, RegexBuilder};

use super::{DetectionResult, Detector, Observations};
use crate::cascade::SelectorType;

const URL_MATCH_CONFIDENCE: f64 = 0.8;
const DOM_MATCH_CONFIDENCE: f64 = 0.95;
const TEXT_MATCH_CONFIDENCE: f64 = 0.6;

#[derive(Debug, Clone)]
enum UrlMatcher {
    Substring(Vec<String>),
    Regex(Vec<Regex>),
}

/// Matches the current URL against substrings or regular expressions.
#[derive(Debug, Clone)]
pub struct UrlPatternDetector {
    matcher: UrlMatcher,
}

impl UrlPatternDetector {
    /// Plain substring matching, e.g. `["/login", "/sign-in"]`.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            matcher: UrlMatcher::Substring(patterns.into_iter().map(Into::into).collect()),
        }
    }

    /// Case-insensitive regular expressions.
    pub fn regex<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let compiled = patterns
            .into_iter()
            .map(|pattern| RegexBuilder::new(pattern.as_ref()).case_insensitive(true).build())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            matcher: UrlMatcher::Regex(compiled),
        })
    }
}

impl Detector for UrlPatternDetector {
    fn evaluate(&self, observations: &Observations) -> DetectionResult {
        let Some(url) = observations.url.as_ref() else {
            return DetectionResult::not_detected("no url observed");
        };
        let url = url.as_str();

        let hit = match &self.matcher {
            UrlMatcher::Substring(patterns) => patterns
                .iter()
                .find(|pattern| url.contains(pattern.as_str()))
                .cloned(),
            UrlMatcher::Regex(patterns) => patterns
                .iter()
                .find(|regex| regex.is_match(url))
                .map(|regex| regex.as_str().to_string()),
        };

        match hit {
            Some(pattern) => DetectionResult::detected(
                URL_MATCH_CONFIDENCE,
                format!("url pattern '{pattern}' matched"),
            ),
            None => DetectionResult::not_detected(format!("no url pattern matched {url}")),
        }
    }
}

/// Matches when any of the selectors is present on the page.
#[derive(Debug, Clone)]
pub struct DomElementDetector {
    selectors: Vec<String>,
    selector_type: SelectorType,
}

impl DomElementDetector {
    pub fn new<I, S>(selectors: I, selector_type: SelectorType) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            selectors: selectors.into_iter().map(Into::into).collect(),
            selector_type,
        }
    }

    pub fn xpath<I, S>(selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(selectors, SelectorType::XPath)
    }

    pub fn css<I, S>(selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(selectors, SelectorType::Css)
    }
}

impl Detector for DomElementDetector {
    fn evaluate(&self, observations: &Observations) -> DetectionResult {
        match self
            .selectors
            .iter()
            .find(|selector| observations.has_selector(selector))
        {
            Some(selector) => DetectionResult::detected(
                DOM_MATCH_CONFIDENCE,
                format!("{} element '{}' present", self.selector_type, selector),
            ),
            None => DetectionResult::not_detected(format!(
                "none of {} {} selectors present",
                self.selectors.len(),
                self.selector_type
            )),
        }
    }
}

/// Searches the page text for any of the patterns.
#[derive(Debug, Clone)]
pub struct TextContentDetector {
    patterns: Vec<String>,
    case_sensitive: bool,
}

impl TextContentDetector {
    pub fn new<I, S>(patterns: I, case_sensitive: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns = patterns
            .into_iter()
            .map(Into::into)
            .map(|pattern: String| {
                if case_sensitive {
                    pattern
                } else {
                    pattern.to_lowercase()
                }
            })
            .collect();
        Self {
            patterns,
            case_sensitive,
        }
    }
}

impl Detector for TextContentDetector {
    fn evaluate(&self, observations: &Observations) -> DetectionResult {
        let Some(text) = observations.page_text.as_deref() else {
            return DetectionResult::not_detected("no page text observed");
        };
        let haystack = if self.case_sensitive {
            text.to_string()
        } else {
            text.to_lowercase()
        };

        match self
            .patterns
            .iter()
            .find(|pattern| haystack.contains(pattern.as_str()))
        {
            Some(pattern) => DetectionResult::detected(
                TEXT_MATCH_CONFIDENCE,
                format!("text '{pattern}' found"),
            ),
            None => DetectionResult::not_detected("no text pattern found"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn login_page() -> Observations {
        Observations::new()
            .with_url(Url::parse("https://example.com/account/login?next=/feed").unwrap())
            .with_page_text("Welcome back. Sign In to continue")
            .with_selector("//form[contains(@action, 'login')]")
    }

    #[test]
    fn url_substring_and_regex() {
        let substring = UrlPatternDetector::new(["/login", "/sign-in"]);
        let result = substring.evaluate(&login_page());
        assert!(result.detected);
        assert_eq!(result.confidence, URL_MATCH_CONFIDENCE);

        let regex = UrlPatternDetector::regex([r"/ACCOUNT/(login|signin)"]).unwrap();
        assert!(regex.evaluate(&login_page()).detected);

        assert!(UrlPatternDetector::regex(["(unclosed"]).is_err());
        assert!(!substring.evaluate(&Observations::new()).detected);
    }

    #[test]
    fn dom_detector_uses_reported_selectors() {
        let detector = DomElementDetector::xpath(["//form[contains(@action, 'login')]"]);
        let result = detector.evaluate(&login_page());
        assert!(result.detected);
        assert_eq!(result.confidence, DOM_MATCH_CONFIDENCE);

        let missing = DomElementDetector::css(["input[type=search]"]);
        let result = missing.evaluate(&login_page());
        assert!(!result.detected);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn text_detector_honours_case_sensitivity() {
        assert!(TextContentDetector::new(["sign in"], false)
            .evaluate(&login_page())
            .detected);
        assert!(!TextContentDetector::new(["sign in"], true)
            .evaluate(&login_page())
            .detected);
    }
}
