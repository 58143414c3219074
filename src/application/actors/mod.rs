pub mod department_actor;

pub use department_actor::{DepartmentActor, DepartmentHandle, DepartmentMessage};
