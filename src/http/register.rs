use axum::Form;
use axum::extract::State;
use axum::response::Html;
use serde::Deserialize;

use crate::activity_pub::machine::{MachineMsg, RegisterRequest, Registered, get_machine};
use crate::error::ApiError;

use super::AppState;

#[derive(Debug, Deserialize)]
pub(super) struct RegisterForm {
    username: String,
    password: String,
    confirmation: String,
}

pub(super) async fn form() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head><title>Register</title></head>
<body>
<form method="post" action="/register">
<label>Username <input type="text" name="username"></label>
<label>Password <input type="password" name="password"></label>
<label>Confirm <input type="password" name="confirmation"></label>
<button type="submit">Register</button>
</form>
</body>
</html>
"#,
    )
}

pub(super) async fn submit(
    State(_state): State<AppState>,
    Form(form): Form<RegisterForm>,
) -> Result<Html<String>, ApiError> {
    let machine = get_machine()?;
    let registered = ractor::call!(
        machine,
        MachineMsg::Register,
        RegisterRequest {
            username: form.username,
            password: form.password,
            confirmation: form.confirmation,
        }
    )
    .map_err(|error| ApiError::Internal(anyhow::anyhow!("machine call failed: {error}")))??;
    Ok(Html(confirmation_page(&registered)))
}

/// The bearer token is shown exactly once, here.
pub(crate) fn confirmation_page(registered: &Registered) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Registered</title></head>
<body>
<p>Welcome, {username}! Your actor is <a href="{actor}">{actor}</a>.</p>
<p>Save this token now; it will not be shown again:
<span class="token">{token}</span></p>
</body>
</html>
"#,
        username = registered.username,
        actor = registered.actor_iri,
        token = registered.token,
    )
}

#[cfg(test)]
mod tests {
    use crate::activity_pub::machine::Registered;

    use super::confirmation_page;

    #[test]
    fn confirmation_exposes_token_in_a_single_span() {
        let html = confirmation_page(&Registered {
            username: "alice".into(),
            actor_iri: "https://social.example/person/abc".into(),
            token: "T0kenT0kenT0ken".into(),
        });
        assert_eq!(html.matches("<span class=\"token\">").count(), 1);
        assert!(html.contains("<span class=\"token\">T0kenT0kenT0ken</span>"));
    }
}
