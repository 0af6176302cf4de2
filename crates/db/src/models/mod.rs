pub mod file_record;
pub mod project;
pub mod project_member;
pub mod session;
pub mod site;
pub mod sync_queue;
pub mod user;
pub mod worker;
