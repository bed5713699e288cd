pub mod accounts;
pub mod leaderboards;
