//! User-data templates.
//!
//! A template may reference `%MINION_PUB%`, `%MINION_PEM%`, `%MINION_ID%`
//! and `%MASTER_HOST%`; each is replaced with the corresponding profile
//! value, or the empty string when the profile leaves it unset.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::paths::read_to_string_ambient;
use crate::profile::VmProfile;

use super::ProvisionError;

/// Substitutes the profile's identity material into `template`.
#[must_use]
pub fn render_userdata(template: &str, profile: &VmProfile) -> String {
    let placeholders = [
        ("%MINION_PUB%", profile.minion_pub.as_deref().unwrap_or_default()),
        ("%MINION_PEM%", profile.minion_pem.as_deref().unwrap_or_default()),
        ("%MINION_ID%", profile.name.as_str()),
        ("%MASTER_HOST%", profile.master_host.as_deref().unwrap_or_default()),
    ];
    placeholders
        .iter()
        .fold(template.to_owned(), |rendered, (placeholder, value)| {
            rendered.replace(placeholder, value)
        })
}

/// Reads, renders and base64-encodes the profile's user-data file.
///
/// Returns `Ok(None)` when the profile names no file.
///
/// # Errors
///
/// Returns [`ProvisionError::Config`] when the file cannot be read.
pub fn encoded_userdata(profile: &VmProfile) -> Result<Option<String>, ProvisionError> {
    let Some(path) = profile.userdata_file.as_deref() else {
        return Ok(None);
    };
    let template = read_to_string_ambient(path).map_err(|message| {
        ProvisionError::Config(format!("failed to read user data {path}: {message}"))
    })?;
    Ok(Some(STANDARD.encode(render_userdata(&template, profile))))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn profile() -> VmProfile {
        VmProfile {
            minion_pub: Some(String::from("ssh-rsa AAA")),
            master_host: Some(String::from("salt.example")),
            ..VmProfile::new("web-1", "ami-1")
        }
    }

    #[test]
    fn placeholders_are_replaced() {
        let rendered = render_userdata(
            "id=%MINION_ID% master=%MASTER_HOST% pub=%MINION_PUB% pem=%MINION_PEM%",
            &profile(),
        );
        assert_eq!(rendered, "id=web-1 master=salt.example pub=ssh-rsa AAA pem=");
    }

    #[test]
    fn file_is_rendered_and_encoded() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("userdata.sh");
        std::fs::write(&path, "#!/bin/sh\necho %MINION_ID%\n").expect("write template");
        let with_file = VmProfile {
            userdata_file: Some(path.to_string_lossy().into_owned()),
            ..profile()
        };

        let encoded = encoded_userdata(&with_file)
            .expect("template readable")
            .expect("user data present");
        let decoded = STANDARD.decode(encoded).expect("valid base64");
        assert_eq!(decoded, b"#!/bin/sh\necho web-1\n");
    }

    #[test]
    fn profiles_without_a_file_send_nothing() {
        assert_eq!(encoded_userdata(&profile()), Ok(None));
    }
}
