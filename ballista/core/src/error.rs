// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Ballista error types

use std::{
    error::Error,
    fmt::{Display, Formatter},
    io, result,
};

pub type Result<T> = result::Result<T, BallistaError>;

/// Ballista error
#[derive(Debug)]
pub enum BallistaError {
    NotImplemented(String),
    General(String),
    /// A collaborator broke an invariant of the scheduler, e.g. an update
    /// arrived for a partition that was already sealed.
    Internal(String),
    IoError(io::Error),
    TokioError(tokio::task::JoinError),
    External(Box<dyn Error + Send + Sync>),
    Cancelled,
}

#[allow(clippy::from_over_into)]
impl<T> Into<Result<T>> for BallistaError {
    fn into(self) -> Result<T> {
        Err(self)
    }
}

pub fn ballista_error(message: &str) -> BallistaError {
    BallistaError::General(message.to_owned())
}

impl From<String> for BallistaError {
    fn from(e: String) -> Self {
        BallistaError::General(e)
    }
}

impl From<io::Error> for BallistaError {
    fn from(e: io::Error) -> Self {
        BallistaError::IoError(e)
    }
}

impl From<tokio::task::JoinError> for BallistaError {
    fn from(e: tokio::task::JoinError) -> Self {
        BallistaError::TokioError(e)
    }
}

impl From<Box<dyn Error + Send + Sync>> for BallistaError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        BallistaError::External(e)
    }
}

impl Display for BallistaError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            BallistaError::NotImplemented(ref desc) => {
                write!(f, "Not implemented: {desc}")
            }
            BallistaError::General(ref desc) => write!(f, "General error: {desc}"),
            BallistaError::Internal(desc) => {
                write!(f, "Internal Ballista error: {desc}")
            }
            BallistaError::IoError(ref desc) => write!(f, "IO error: {desc}"),
            BallistaError::TokioError(desc) => write!(f, "Tokio join error: {desc}"),
            BallistaError::External(desc) => write!(f, "External error: {desc}"),
            BallistaError::Cancelled => write!(f, "Task cancelled"),
        }
    }
}

impl Error for BallistaError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BallistaError::IoError(e) => Some(e),
            BallistaError::TokioError(e) => Some(e),
            BallistaError::External(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}
