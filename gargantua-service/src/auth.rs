// Copyright 2025 The Gargantua Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Authentication and authorization seams of the gateway. The gateway only
//! sees the two traits; deployments plug in whatever backs them.

use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gargantua_config::gargantua::{AuthConfig, StaticUserConfig};
use gargantua_error::{Code, Error, make_err};
use gargantua_resources::GROUP;

const ALLOW_ALL_USER: &str = "admin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub id: String,
    pub admin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Delete,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "get",
            Self::List => "list",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// `hobbyfarm.io/<resource>` x verb.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Permission {
    pub resource: String,
    pub verb: Verb,
}

impl Permission {
    pub fn new(plural: &str, verb: Verb) -> Self {
        Self {
            resource: format!("{GROUP}/{plural}"),
            verb,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verb, self.resource)
    }
}

#[async_trait]
pub trait AuthN: fmt::Debug + Send + Sync + 'static {
    /// Resolves a bearer token. `token` is empty when the request carried
    /// none.
    async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser, Error>;
}

#[async_trait]
pub trait AuthR: fmt::Debug + Send + Sync + 'static {
    async fn authorize(
        &self,
        user: &AuthenticatedUser,
        permission: &Permission,
    ) -> Result<bool, Error>;
}

/// Authenticates every request, as the token's user or as an admin when
/// there is no token, and grants everything. Development only.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AuthN for AllowAll {
    async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser, Error> {
        let id = if token.is_empty() {
            ALLOW_ALL_USER
        } else {
            token
        };
        Ok(AuthenticatedUser {
            id: id.to_string(),
            admin: true,
        })
    }
}

#[async_trait]
impl AuthR for AllowAll {
    async fn authorize(&self, _: &AuthenticatedUser, _: &Permission) -> Result<bool, Error> {
        Ok(true)
    }
}

/// A fixed token table. Admins hold every permission; everybody else holds
/// none of the admin ones.
#[derive(Clone, Default)]
pub struct StaticTokens {
    users: HashMap<String, AuthenticatedUser>,
}

impl fmt::Debug for StaticTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokens")
            .field("users", &self.users.len())
            .finish()
    }
}

impl StaticTokens {
    pub fn new(users: &[StaticUserConfig]) -> Self {
        Self {
            users: users
                .iter()
                .map(|user| {
                    (
                        user.token.clone(),
                        AuthenticatedUser {
                            id: user.user_id.clone(),
                            admin: user.admin,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[async_trait]
impl AuthN for StaticTokens {
    async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser, Error> {
        if token.is_empty() {
            return Err(make_err!(Code::Unauthenticated, "No bearer token"));
        }
        self.users
            .get(token)
            .cloned()
            .ok_or_else(|| make_err!(Code::Unauthenticated, "Unknown bearer token"))
    }
}

#[async_trait]
impl AuthR for StaticTokens {
    async fn authorize(&self, user: &AuthenticatedUser, _: &Permission) -> Result<bool, Error> {
        Ok(user.admin)
    }
}

pub fn from_config(config: &AuthConfig) -> (Arc<dyn AuthN>, Arc<dyn AuthR>) {
    match config {
        AuthConfig::AllowAll => (Arc::new(AllowAll), Arc::new(AllowAll)),
        AuthConfig::StaticTokens(users) => {
            let tokens = Arc::new(StaticTokens::new(users));
            (tokens.clone(), tokens)
        }
    }
}

/// Fails with `PermissionDenied` unless `user` holds `permission`.
pub async fn require(
    authr: &dyn AuthR,
    user: &AuthenticatedUser,
    permission: &Permission,
) -> Result<(), Error> {
    if authr.authorize(user, permission).await? {
        return Ok(());
    }
    Err(make_err!(
        Code::PermissionDenied,
        "User {} may not {permission}",
        user.id
    ))
}
