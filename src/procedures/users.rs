//! `add-user`: create a local account with optional supplementary groups.

use crate::context::Context;
use crate::error::StepFailure;
use crate::input::InputRequest;
use crate::preconditions::Requirements;
use crate::procedure::Procedure;
use crate::step::{Outcome, Step};

use super::command;

const MAX_NAME_LEN: usize = 32;

pub struct AddUser;

impl Procedure for AddUser {
    fn name(&self) -> &'static str {
        "add-user"
    }

    fn description(&self) -> &'static str {
        "Create a local user account and add it to groups"
    }

    fn requirements(&self) -> Requirements {
        Requirements::new()
            .root()
            .binary("useradd")
            .binary("usermod")
            .binary("id")
    }

    fn resource(&self) -> Option<&'static str> {
        Some("user-accounts")
    }

    fn inputs(&self) -> Vec<InputRequest> {
        vec![
            InputRequest::required("username", "Username for the new account"),
            InputRequest::optional("groups", "Supplementary groups (comma separated)"),
        ]
    }

    fn steps(&self) -> Vec<Step> {
        vec![
            Step::critical("validate-username", validate_username_step)
                .describe("Check the username is a valid POSIX login name"),
            Step::optional("check-existing", check_existing)
                .describe("Report whether the account already exists"),
            Step::critical("create-user", create_user).describe("Create the account with a home"),
            Step::optional("add-groups", add_groups).describe("Add supplementary groups"),
        ]
    }
}

/// Portable login name: lowercase letter or `_` first, then
/// `[a-z0-9_-]`, at most 32 characters, optional trailing `$`
pub fn validate_name(name: &str) -> Result<(), String> {
    let body = name.strip_suffix('$').unwrap_or(name);
    let mut chars = body.chars();
    match chars.next() {
        None => return Err("name is empty".to_string()),
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        Some(c) => return Err(format!("'{name}' must start with a lowercase letter or '_', not '{c}'")),
    }
    if let Some(c) = chars.find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))) {
        return Err(format!("'{name}' contains invalid character '{c}'"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!("'{name}' is longer than {MAX_NAME_LEN} characters"));
    }
    Ok(())
}

/// Split and validate the comma separated `groups` answer
pub fn parse_groups(raw: &str) -> Result<Vec<String>, String> {
    let groups: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(str::to_string)
        .collect();
    for group in &groups {
        validate_name(group)?;
    }
    Ok(groups)
}

fn username(ctx: &Context) -> Result<&str, StepFailure> {
    let name = ctx.require_param("username")?.trim();
    validate_name(name).map_err(StepFailure::invalid)?;
    Ok(name)
}

/// `Some(uid)` when the account exists
fn existing_uid(ctx: &Context, name: &str) -> Result<Option<String>, StepFailure> {
    let output = ctx.exec(&command("id", &["-u", name]).read_only())?;
    match output.exit_code {
        Some(0) => Ok(Some(output.stdout_trimmed().to_string())),
        Some(1) => Ok(None),
        _ => {
            output.ensure_success("id")?;
            Ok(None)
        }
    }
}

fn validate_username_step(ctx: &Context) -> Result<Outcome, StepFailure> {
    let name = username(ctx)?;
    Ok(Outcome::success(format!("'{name}' is a valid login name")))
}

fn check_existing(ctx: &Context) -> Result<Outcome, StepFailure> {
    let name = username(ctx)?;
    Ok(match existing_uid(ctx, name)? {
        Some(uid) => Outcome::success(format!("'{name}' exists (uid {uid})")),
        None => Outcome::success(format!("'{name}' does not exist yet")),
    })
}

fn create_user(ctx: &Context) -> Result<Outcome, StepFailure> {
    let name = username(ctx)?;
    if let Some(uid) = existing_uid(ctx, name)? {
        return Ok(Outcome::skipped(format!("'{name}' already exists (uid {uid})")));
    }
    ctx.exec_checked(&command("useradd", &["-m", name]))?;
    Ok(Outcome::success(format!("created '{name}'")))
}

fn add_groups(ctx: &Context) -> Result<Outcome, StepFailure> {
    let name = username(ctx)?;
    let groups = parse_groups(ctx.param("groups").unwrap_or("")).map_err(StepFailure::invalid)?;
    if groups.is_empty() {
        return Ok(Outcome::skipped("no supplementary groups requested"));
    }
    let list = groups.join(",");
    ctx.exec_checked(&command("usermod", &["-aG", &list, name]))?;
    Ok(Outcome::success(format!("'{name}' added to {list}")))
}
