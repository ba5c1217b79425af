//! Line-based operator prompts that collect a [`SessionRequest`] before any
//! directory call is made.

use std::io::{self, BufRead, Write};

use thiserror::Error;

use crate::{
    grants::{GrantParseError, PermissionGrant},
    orchestrator::{ApplicationSource, SessionRequest, UserSource},
    roles::RoleSelection,
};

const SKIP_USER: &str = "n";
const PERMISSION_EXAMPLE: &str = "e.g. 00000003-0000-0000-c000-000000000000 9e3f62cf-ca93-4989-b6ce-bf83c28f9fe8 adds the Microsoft Graph application permission RoleManagement.ReadWrite.Directory";

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("failed to read operator input: {0}")]
    Io(#[from] io::Error),
    #[error("invalid permission line `{line}`: {source}")]
    InvalidGrant {
        line: String,
        #[source]
        source: GrantParseError,
    },
    #[error("{0}; expected 1, 2 or 3")]
    InvalidRole(String),
    #[error("input ended before `{0}` was answered")]
    UnexpectedEof(String),
}

struct Prompter<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Prompter<R, W> {
    fn say(&mut self, text: &str) -> Result<(), RequestError> {
        writeln!(self.output, "{text}")?;
        Ok(())
    }

    /// Prints the question and reads one trimmed line. End of input aborts, so a
    /// closed stdin never answers with defaults.
    fn ask(&mut self, lines: &[&str]) -> Result<String, RequestError> {
        writeln!(self.output)?;
        for line in lines {
            writeln!(self.output, "{line}")?;
        }
        self.output.flush()?;
        let mut answer = String::new();
        if self.input.read_line(&mut answer)? == 0 {
            let question = lines.first().copied().unwrap_or_default();
            return Err(RequestError::UnexpectedEof(question.to_string()));
        }
        Ok(answer.trim().to_string())
    }
}

/// Asks, in order: existing application client id, permission pairs, user, role
/// and teardown confirmation.
pub fn collect_request<R: BufRead, W: Write>(
    input: R,
    output: W,
) -> Result<SessionRequest, RequestError> {
    let mut prompter = Prompter { input, output };

    let app_id = prompter.ask(&["enter app client id, leave blank to create app:"])?;
    let application = if app_id.is_empty() {
        ApplicationSource::Create
    } else {
        ApplicationSource::Existing(app_id)
    };

    let mut grants = Vec::new();
    loop {
        let line = prompter.ask(&[
            "add permission to the app, leave blank to finish: <resourceAppId> <permissionId>",
            PERMISSION_EXAMPLE,
        ])?;
        if line.split_whitespace().count() < 2 {
            break;
        }
        let grant = line
            .parse::<PermissionGrant>()
            .map_err(|source| RequestError::InvalidGrant {
                line: line.clone(),
                source,
            })?;
        if grants.contains(&grant) {
            prompter.say("permission already listed")?;
        } else {
            grants.push(grant);
        }
    }

    let user_answer = prompter.ask(&[
        "enter the object id of the user who will manage the app, leave blank to create one:",
        "(enter \"n\" to skip this stage)",
    ])?;
    let user = match user_answer.as_str() {
        "" => UserSource::Create,
        answer if answer.eq_ignore_ascii_case(SKIP_USER) => UserSource::Skip,
        answer => UserSource::Existing(answer.to_string()),
    };

    let role = if user == UserSource::Skip {
        None
    } else {
        let answer = prompter.ask(&[
            "how should this user manage the app? leave blank for no role",
            "(1=Owner, 2=Application Administrator, 3=Cloud Application Administrator)",
        ])?;
        if answer.is_empty() {
            None
        } else {
            Some(answer.parse::<RoleSelection>().map_err(RequestError::InvalidRole)?)
        }
    };

    let teardown = prompter.ask(&["remove all created resources when setup finishes? (y/n)"])?;
    let teardown = matches!(teardown.to_ascii_lowercase().as_str(), "y" | "yes");

    Ok(SessionRequest {
        application,
        grants,
        user,
        role,
        teardown,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(script: &str) -> Result<SessionRequest, RequestError> {
        collect_request(script.as_bytes(), Vec::new())
    }

    #[test]
    fn blank_answers_create_everything_without_teardown() {
        let request = collect("\n\n\n\nn\n").unwrap();
        assert_eq!(request.application, ApplicationSource::Create);
        assert!(request.grants.is_empty());
        assert_eq!(request.user, UserSource::Create);
        assert_eq!(request.role, None);
        assert!(!request.teardown);
    }

    #[test]
    fn full_script_is_collected_in_order() {
        let script = "\
abc-client-id
00000003-0000-0000-c000-000000000000 9e3f62cf-ca93-4989-b6ce-bf83c28f9fe8
00000003-0000-0000-c000-000000000000 9e3f62cf-ca93-4989-b6ce-bf83c28f9fe8
00000003-0000-0000-c000-000000000000 741f803b-c850-494e-b5df-cde7c675a1ca
x
user-object-id
2
y
";
        let request = collect(script).unwrap();
        assert_eq!(
            request.application,
            ApplicationSource::Existing("abc-client-id".into())
        );
        assert_eq!(request.grants.len(), 2);
        assert_eq!(request.user, UserSource::Existing("user-object-id".into()));
        assert_eq!(request.role, Some(RoleSelection::ApplicationAdministrator));
        assert!(request.teardown);
    }

    #[test]
    fn skipping_the_user_skips_the_role_question() {
        let request = collect("\n\nn\nyes\n").unwrap();
        assert_eq!(request.user, UserSource::Skip);
        assert_eq!(request.role, None);
        assert!(request.teardown);
    }

    #[test]
    fn malformed_pairs_and_roles_are_rejected() {
        assert!(matches!(
            collect("\n00000003-0000-0000-c000-000000000000 nope\n"),
            Err(RequestError::InvalidGrant { .. })
        ));
        assert!(matches!(
            collect("\n\n\n9\n"),
            Err(RequestError::InvalidRole(_))
        ));
    }

    #[test]
    fn closed_input_aborts_instead_of_defaulting() {
        assert!(matches!(collect(""), Err(RequestError::UnexpectedEof(_))));
        match collect("\n\n\n") {
            Err(RequestError::UnexpectedEof(question)) => {
                assert!(question.starts_with("how should this user manage the app"));
            }
            other => panic!("expected end-of-input error, got {other:?}"),
        }
    }
}
