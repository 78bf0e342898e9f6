/// Decides whether an outgoing call is a generation request worth watching.
///
/// Two ordered pattern lists are matched against the URL.  Deny patterns are
/// checked first and always win: several generation endpoints share a prefix
/// with character/profile/settings endpoints, and the deny list carves those
/// out.
use regex::{Regex, RegexBuilder};

/// Generation endpoints of the common chat front-end backends.
pub const BUILTIN_ALLOW: &[&str] = &[
    r"/api/openai/chat/completions",
    r"/api/openai/completions",
    r"/api/chat/completions",
    r"/api/extra/generate",
    r"/api/textgen.*generate",
    r"/api/kobold.*generate",
    r"/api/ollama.*generate",
    r"/api/vllm.*generate",
    r"/api/claude.*(chat|complete)",
    r"/api/gemini.*(chat|generate)",
    r"/api/.*/generate",
];

/// Management endpoints that look like generation endpoints.
pub const BUILTIN_DENY: &[&str] =
    &[r"/api/(characters|chats|history|profile|settings|quick|preset|images?|assets?)\b"];

/// Which rule decided a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Method is not exactly `POST`.
    NotPost,
    /// URL matched the deny pattern at this index.
    Denied(usize),
    /// URL matched the allow pattern at this index.
    Allowed(usize),
    /// URL matched nothing.
    Unmatched,
}

impl Verdict {
    pub fn is_generation(self) -> bool {
        matches!(self, Verdict::Allowed(_))
    }
}

#[derive(Debug, Clone)]
pub struct Classifier {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
}

impl Classifier {
    pub fn builtin() -> Self {
        // The built-in lists are literals covered by tests.
        Self::with_extra::<&str>(&[], &[]).expect("built-in classifier patterns are valid")
    }

    /// Built-in lists with `extra_allow` / `extra_deny` appended after them.
    pub fn with_extra<S: AsRef<str>>(
        extra_allow: &[S],
        extra_deny: &[S],
    ) -> Result<Self, regex::Error> {
        let allow = BUILTIN_ALLOW
            .iter()
            .copied()
            .chain(extra_allow.iter().map(AsRef::as_ref))
            .map(compile)
            .collect::<Result<Vec<_>, _>>()?;
        let deny = BUILTIN_DENY
            .iter()
            .copied()
            .chain(extra_deny.iter().map(AsRef::as_ref))
            .map(compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { allow, deny })
    }

    pub fn is_generation_request(&self, url: &str, method: &str) -> bool {
        self.verdict(url, method).is_generation()
    }

    pub fn verdict(&self, url: &str, method: &str) -> Verdict {
        if method != "POST" {
            return Verdict::NotPost;
        }
        if let Some(i) = self.deny.iter().position(|re| re.is_match(url)) {
            return Verdict::Denied(i);
        }
        match self.allow.iter().position(|re| re.is_match(url)) {
            Some(i) => Verdict::Allowed(i),
            None => Verdict::Unmatched,
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::builtin()
    }
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}
