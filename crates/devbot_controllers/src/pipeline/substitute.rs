//! `${VAR}` / `$VAR` expansion of rendered manifests.

/// Values available to manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables {
    pub application: String,
    pub branch: String,
    pub commit_sha: String,
    /// Slug of the environment's preferred branch.
    pub environment: String,
}

impl Variables {
    fn lookup(&self, name: &str) -> Option<&str> {
        match name {
            "APPLICATION" => Some(&self.application),
            "BRANCH" => Some(&self.branch),
            "COMMIT_SHA" => Some(&self.commit_sha),
            "ENVIRONMENT" => Some(&self.environment),
            _ => None,
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Replaces known variables; unknown ones and stray `$` stay as they are.
pub fn substitute(input: &str, vars: &Variables) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                let name = &braced[..end];
                if let Some(value) = vars.lookup(name) {
                    out.push_str(value);
                    rest = &braced[end + 1..];
                    continue;
                }
            }
        } else {
            let len = after.find(|c: char| !is_name_char(c)).unwrap_or(after.len());
            if let Some(value) = vars.lookup(&after[..len]) {
                out.push_str(value);
                rest = &after[len..];
                continue;
            }
        }

        out.push('$');
        rest = after;
    }

    out.push_str(rest);
    out
}
