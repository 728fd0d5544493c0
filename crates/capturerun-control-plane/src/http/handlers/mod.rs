//! HTTP request handlers.

mod events;
mod health;
mod manual;
mod tasks;
mod workpools;

pub use events::stream_events;
pub use health::{health_check, metrics_handler};
pub use manual::{cancel_ticket, create_ticket, next_ticket, redeem_ticket};
pub use tasks::{
    abort_all_tasks, abort_task, cleanup_tasks, delete_task, get_limits, get_task, list_tasks,
    move_task, put_limits, submit_conversion, unstall_task,
};
pub use workpools::{add_instance, list_workpools, remove_instance};
