// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of wandersphere.
//
// wandersphere is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// wandersphere is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with wandersphere.  If not,
// see <http://www.gnu.org/licenses/>.

//! # wandersphere models
//!
//! ## Introduction
//!
//! I hate these sort of "catch-all" modules named "models" or "entities", but these types are truly
//! foundational: users, posts, comments, and the refined string types that gate what's allowed
//! into the system.

use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("bcrypt failure: {source}"))]
    Bcrypt {
        source: bcrypt::BcryptError,
        backtrace: Backtrace,
    },
    #[snafu(display("{text} is not a valid date (expected YYYY-MM-DD)"))]
    BadDate { text: String, backtrace: Backtrace },
    #[snafu(display("{email} is not a valid e-mail address"))]
    BadEmail { email: String, backtrace: Backtrace },
    #[snafu(display("The supplied password contains illegal characters or is mis-sized"))]
    BadPassword { backtrace: Backtrace },
    #[snafu(display("{name} is not a valid wandersphere username"))]
    BadUsername { name: String, backtrace: Backtrace },
    #[snafu(display("Incorrect password"))]
    IncorrectPassword { backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// define_id!
///
/// Use this to declare a type intended to be used as an opaque identifier for some other sort of
/// entity. Identifiers here are 64-bit integers assigned monotonically by the datastore; this
/// macro wraps them in newtype structs so that a `UserId` can never be handed to something
/// expecting a `PostId`.
///
/// The wire representations are less tidy: identifiers travel as bare i64s over gRPC and as
/// decimal strings in the key-value store, so the macro also provides conversions both ways.
macro_rules! define_id {
    ($type_name:ident) => {
        #[derive(
            Clone,
            Copy,
            Debug,
            Deserialize,
            Eq,
            Hash,
            Ord,
            PartialEq,
            PartialOrd,
            Serialize,
            sqlx::Type,
        )]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $type_name(i64);

        impl $type_name {
            pub fn new(id: i64) -> $type_name {
                $type_name(id)
            }
            pub fn as_i64(&self) -> i64 {
                self.0
            }
            /// Parse the decimal-string representation used in the key-value store
            pub fn from_decimal(s: &str) -> StdResult<$type_name, std::num::ParseIntError> {
                Ok($type_name(s.parse::<i64>()?))
            }
        }

        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $type_name {
            fn from(id: i64) -> Self {
                $type_name(id)
            }
        }

        impl From<$type_name> for i64 {
            fn from(id: $type_name) -> Self {
                id.0
            }
        }
    };
}

define_id!(UserId);
define_id!(PostId);
define_id!(CommentId);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Username                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A refined type representing a wandersphere username
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct Username(String);

fn username_char(x: u8) -> bool {
    (x > 47 && x < 58) || (x > 64 && x < 91) || (x > 96 && x < 123) || x == 45 || x == 95
}

impl Username {
    /// wandersphere usernames consist of four to two hundred alphanumeric characters, '-' & '_'
    pub fn new(name: &str) -> Result<Username> {
        ((4..=200).contains(&name.len()) && name.as_bytes().iter().cloned().all(username_char))
            .then_some(Username(name.to_owned()))
            .ok_or(
                BadUsernameSnafu {
                    name: name.to_owned(),
                }
                .build(),
            )
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Username {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        Username::new(s)
    }
}

impl Display for Username {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            UserEmail                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A refined type representing a user's contact e-mail
///
/// Validation here is intentionally loose (one '@', non-empty on both sides); anything stricter
/// and one ends up re-implementing RFC 5321 badly.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct UserEmail(String);

impl UserEmail {
    pub fn new(email: &str) -> Result<UserEmail> {
        match email.split_once('@') {
            Some((local, host)) if !local.is_empty() && !host.is_empty() => {
                Ok(UserEmail(email.to_owned()))
            }
            _ => BadEmailSnafu {
                email: email.to_owned(),
            }
            .fail(),
        }
    }
}

impl AsRef<str> for UserEmail {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for UserEmail {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        UserEmail::new(s)
    }
}

impl Display for UserEmail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Password                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn password_char(x: u8) -> bool {
    // The printable ASCII range, space included
    (32..127).contains(&x)
}

/// A candidate password: printable ASCII, four to two hundred characters
///
/// Note this is the *plain text*; it exists only long enough to be hashed or checked, and is
/// wrapped in [SecretString] so it can't leak into logs via Debug.
#[derive(Clone, Debug)]
pub struct Password(SecretString);

impl Password {
    pub fn new(text: SecretString) -> Result<Password> {
        let bytes = text.expose_secret().as_bytes();
        ((4..=200).contains(&bytes.len()) && bytes.iter().cloned().all(password_char))
            .then_some(Password(text))
            .ok_or(BadPasswordSnafu.build())
    }
    fn expose(&self) -> &[u8] {
        self.0.expose_secret().as_bytes()
    }
}

/// Salted bcrypt digest of a password
///
/// The digest is computed over the password bytes concatenated with a per-user random salt. The
/// salt is stored alongside the hash & regenerated whenever the password changes.
#[derive(Clone, Debug, PartialEq)]
pub struct PasswordHash {
    salt: Vec<u8>,
    hashed: String,
}

const SALT_LEN: usize = 16;

const BCRYPT_COST: u32 = 10;

impl PasswordHash {
    /// Hash `password` under a freshly-generated salt
    pub fn new(password: &Password) -> Result<PasswordHash> {
        let mut salt = vec![0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        PasswordHash::with_salt(password, salt)
    }
    pub fn with_salt(password: &Password, salt: Vec<u8>) -> Result<PasswordHash> {
        let mut buf = password.expose().to_vec();
        buf.extend_from_slice(&salt);
        let hashed = bcrypt::hash(&buf, BCRYPT_COST).context(BcryptSnafu)?;
        Ok(PasswordHash { salt, hashed })
    }
    /// Re-assemble from stored parts
    pub fn from_parts(salt: Vec<u8>, hashed: String) -> PasswordHash {
        PasswordHash { salt, hashed }
    }
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }
    pub fn hashed(&self) -> &str {
        &self.hashed
    }
    /// Verify `password` against this digest
    pub fn check(&self, password: &Password) -> Result<()> {
        let mut buf = password.expose().to_vec();
        buf.extend_from_slice(&self.salt);
        bcrypt::verify(&buf, &self.hashed)
            .context(BcryptSnafu)?
            .then_some(())
            .ok_or(IncorrectPasswordSnafu.build())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             dates                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Parse a YYYY-MM-DD date of birth
pub fn parse_birth_date(text: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").ok().context(BadDateSnafu {
        text: text.to_owned(),
    })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              User                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A wandersphere user, secrets included
///
/// This type only ever lives inside the authoring service; what crosses the wire is [UserProfile].
#[derive(Clone, Debug)]
pub struct User {
    pub id: UserId,
    pub username: Username,
    pub email: UserEmail,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub password: PasswordHash,
}

impl User {
    pub fn check_password(&self, password: &Password) -> Result<()> {
        self.password.check(password)
    }
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            date_of_birth: self.date_of_birth,
        }
    }
}

/// The non-secret fields of a [User]
#[derive(Clone, Debug, PartialEq)]
pub struct UserProfile {
    pub id: UserId,
    pub username: Username,
    pub email: UserEmail,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Post                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A post, as the authoring service sees it
///
/// `deleted_at` non-null means the post is hidden; a hard delete removes the row (and its comments
/// & likes) outright.
#[derive(Clone, Debug, PartialEq)]
pub struct Post {
    pub id: PostId,
    pub user_id: UserId,
    pub content_text: String,
    pub content_image_path: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Post {
    pub fn visible(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Join image URLs into the single space-separated string the datastore expects
///
/// This one-string-many-URLs encoding predates this implementation & is load-bearing for existing
/// rows and clients; do not change it.
pub fn join_image_paths(paths: &[String]) -> String {
    paths.join(" ")
}

/// Invert [join_image_paths]
pub fn split_image_paths(joined: &str) -> Vec<String> {
    joined
        .split(' ')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_owned())
        .collect()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Comment                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, PartialEq)]
pub struct Comment {
    pub id: CommentId,
    pub post_id: PostId,
    pub user_id: UserId,
    pub content_text: String,
    pub created_at: DateTime<Utc>,
}

/// A post along with its comments & the users who've liked it
#[derive(Clone, Debug)]
pub struct PostDetail {
    pub post: Post,
    pub comments: Vec<Comment>,
    pub users_liked: Vec<UserId>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn usernames() {
        assert!(Username::new("alice01").is_ok());
        assert!(Username::new("al-ice_01").is_ok());
        assert!(Username::new("abc").is_err()); // too short
        assert!(Username::new("alice bob").is_err()); // no spaces
        assert!(Username::new("alice.01").is_err()); // no dots
        assert!(Username::new(&"x".repeat(201)).is_err());
        assert!(Username::new(&"x".repeat(200)).is_ok());
    }

    #[test]
    fn emails() {
        assert!(UserEmail::new("a@x").is_ok());
        assert!(UserEmail::new("a@").is_err());
        assert!(UserEmail::new("@x").is_err());
        assert!(UserEmail::new("ax").is_err());
    }

    #[test]
    fn passwords() {
        assert!(Password::new("Abcd1234!".into()).is_ok());
        assert!(Password::new("abc".into()).is_err());
        assert!(Password::new("tabs\tare\tout".into()).is_err());
    }

    // `CheckUserAuthentication(name, pw)` must return OK iff the bytes pw ∥ salt verify against
    // the stored bcrypt hash.
    #[test]
    fn password_round_trip() {
        let password = Password::new("Abcd1234!".into()).unwrap();
        let hash = PasswordHash::new(&password).unwrap();
        assert!(hash.check(&password).is_ok());
        assert!(hash
            .check(&Password::new("Abcd1234?".into()).unwrap())
            .is_err());
        // A re-hash under a new salt still verifies
        let rehash = PasswordHash::new(&password).unwrap();
        assert_ne!(hash.salt(), rehash.salt());
        assert!(rehash.check(&password).is_ok());
    }

    #[test]
    fn image_paths_round_trip() {
        let paths = vec![
            "https://x.example/1.png".to_owned(),
            "/api/v1/binaries/2.png".to_owned(),
        ];
        assert_eq!(
            join_image_paths(&paths),
            "https://x.example/1.png /api/v1/binaries/2.png"
        );
        assert_eq!(split_image_paths(&join_image_paths(&paths)), paths);
        assert!(split_image_paths("").is_empty());
    }

    #[test]
    fn birth_dates() {
        assert!(parse_birth_date("1990-01-01").is_ok());
        assert!(parse_birth_date("01-01-1990").is_err());
        assert!(parse_birth_date("1990-13-01").is_err());
    }
}
