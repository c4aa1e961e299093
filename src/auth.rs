use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Cleartext password check. The admin user has its own password; every other
/// user name is a guest and shares the guest password.
#[derive(Debug)]
pub struct InnkeepAuthSource {
    guest_password: String,
    admin_user: String,
    admin_password: String,
}

impl InnkeepAuthSource {
    pub fn new(guest_password: String, admin_user: String, admin_password: String) -> Self {
        Self {
            guest_password,
            admin_user,
            admin_password,
        }
    }

    pub fn is_admin(&self, user: Option<&str>) -> bool {
        user == Some(self.admin_user.as_str())
    }

    fn password_for(&self, user: Option<&str>) -> &str {
        if self.is_admin(user) {
            &self.admin_password
        } else {
            &self.guest_password
        }
    }
}

#[async_trait]
impl AuthSource for InnkeepAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let password = self.password_for(login.user());
        Ok(Password::new(None, password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_and_guest_passwords() {
        let auth = InnkeepAuthSource::new("guestpw".into(), "owner".into(), "ownerpw".into());
        assert!(auth.is_admin(Some("owner")));
        assert!(!auth.is_admin(Some("guest")));
        assert!(!auth.is_admin(None));
        assert_eq!(auth.password_for(Some("owner")), "ownerpw");
        assert_eq!(auth.password_for(Some("anyone")), "guestpw");
    }
}
