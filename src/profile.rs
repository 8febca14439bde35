use serde::{Deserialize, Serialize};
use std::env;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;

use crate::entities::Role;
use crate::error::{storage_error, Error};

/// The one piece of device-local state: who is signed in and as what, so
/// onboarding is skipped on later launches. Not part of the negotiation
/// protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: i64,
    pub role: Role,
}

pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_env() -> Result<Self, Error> {
        Ok(Self::new(env::var("HAGGLE_PROFILE_PATH")?))
    }

    pub async fn load(&self) -> Result<Option<Profile>, Error> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(storage_error(err)),
        }
    }

    pub async fn save(&self, profile: &Profile) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(storage_error)?;
        }

        let bytes = serde_json::to_vec(profile)?;

        fs::write(&self.path, bytes).await.map_err(storage_error)
    }

    pub async fn clear(&self) -> Result<(), Error> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_error(err)),
        }
    }
}
