pub mod backup;
pub mod check;
pub mod dump;
pub mod forget;
pub mod init;
pub mod locks;
pub mod restore;
pub mod snapshots;
pub mod unlock;
