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

//! Interoperability for protocol buffer-generated types
//!
//! One downside to using gRPC for intra-cluster communications is that one has to implement
//! conversions to & from the prost-generated types by hand. They're all gathered here, next to the
//! generated code itself, so the rest of the crate can deal in [entities](crate::entities) types.

use chrono::NaiveDate;
use snafu::{prelude::*, Backtrace};

use crate::entities::{Comment, PostDetail, UserProfile};

pub mod protobuf {
    tonic::include_proto!("wandersphere");
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{seconds} is out of range for a date"))]
    BadDate { seconds: i64, backtrace: Backtrace },
    #[snafu(display("Invalid e-mail on the wire: {source}"))]
    Email { source: crate::entities::Error },
    #[snafu(display("Invalid username on the wire: {source}"))]
    Username { source: crate::entities::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              dates                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Dates of birth travel as Unix seconds at midnight UTC
pub fn date_to_unix(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0).unwrap(/* known good */).and_utc().timestamp()
}

pub fn date_from_unix(seconds: i64) -> Result<NaiveDate> {
    chrono::DateTime::from_timestamp(seconds, 0)
        .map(|dt| dt.date_naive())
        .context(BadDateSnafu { seconds })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                            entities::UserProfile <=> protobuf::UserDetailInfo                  //
////////////////////////////////////////////////////////////////////////////////////////////////////

impl From<UserProfile> for protobuf::UserDetailInfo {
    fn from(value: UserProfile) -> protobuf::UserDetailInfo {
        protobuf::UserDetailInfo {
            user_id: value.id.as_i64(),
            user_name: value.username.to_string(),
            first_name: value.first_name,
            last_name: value.last_name,
            date_of_birth: date_to_unix(value.date_of_birth),
            email: value.email.to_string(),
        }
    }
}

impl TryFrom<protobuf::UserDetailInfo> for UserProfile {
    type Error = Error;

    fn try_from(value: protobuf::UserDetailInfo) -> Result<UserProfile> {
        Ok(UserProfile {
            id: value.user_id.into(),
            username: crate::entities::Username::new(&value.user_name).context(UsernameSnafu)?,
            email: crate::entities::UserEmail::new(&value.email).context(EmailSnafu)?,
            first_name: value.first_name,
            last_name: value.last_name,
            date_of_birth: date_from_unix(value.date_of_birth)?,
        })
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                               entities::Comment => protobuf::Comment                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

impl From<Comment> for protobuf::Comment {
    fn from(value: Comment) -> protobuf::Comment {
        protobuf::Comment {
            comment_id: value.id.as_i64(),
            post_id: value.post_id.as_i64(),
            user_id: value.user_id.as_i64(),
            content_text: value.content_text,
            created_at: value.created_at.timestamp(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                            entities::PostDetail => protobuf::PostDetailInfo                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

impl From<PostDetail> for protobuf::PostDetailInfo {
    fn from(value: PostDetail) -> protobuf::PostDetailInfo {
        protobuf::PostDetailInfo {
            post_id: value.post.id.as_i64(),
            user_id: value.post.user_id.as_i64(),
            content_text: value.post.content_text,
            content_image_path: value.post.content_image_path,
            created_at: value.post.created_at.timestamp(),
            comments: value.comments.into_iter().map(Into::into).collect(),
            users_liked: value
                .users_liked
                .into_iter()
                .map(|id| id.as_i64())
                .collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dates_round_trip() {
        let date = NaiveDate::from_ymd_opt(1990, 1, 1).unwrap();
        assert_eq!(date_from_unix(date_to_unix(date)).unwrap(), date);
        assert!(date_from_unix(i64::MAX).is_err());
    }
}
