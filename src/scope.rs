use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::error::{AnalyticsError, AnalyticsResult};
use crate::models::{CourseId, EffectiveSelection, Identity, Role, Scope, Selection, StudentId};
use crate::retry::RetryPolicy;
use crate::store::Backend;

/// Narrows requested selections to what an identity may see.
pub struct ScopeResolver {
    backend: Arc<dyn Backend>,
    retry: RetryPolicy,
}

impl ScopeResolver {
    pub fn new(backend: Arc<dyn Backend>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    /// Resolve a selection for `identity`.
    ///
    /// Admins get exactly what they ask for. Teachers get the intersection
    /// with their assigned courses, and an `Authorization` error when that
    /// intersection is empty for a non-empty request. Students always get
    /// their own records; requested course ids are ignored.
    pub async fn resolve(
        &self,
        identity: &Identity,
        requested: &Selection,
    ) -> AnalyticsResult<EffectiveSelection> {
        let scope = match identity.role {
            Role::Admin => {
                self.ensure_known(&requested.course_ids).await?;
                Scope::Courses {
                    course_ids: requested.course_ids.clone(),
                }
            }
            Role::Teacher => {
                self.ensure_known(&requested.course_ids).await?;
                if requested.course_ids.is_empty() {
                    Scope::Courses {
                        course_ids: BTreeSet::new(),
                    }
                } else {
                    let assigned = self.assigned(&identity.id).await?;
                    let permitted: BTreeSet<CourseId> = requested
                        .course_ids
                        .intersection(&assigned)
                        .cloned()
                        .collect();
                    if permitted.is_empty() {
                        return Err(AnalyticsError::Authorization(format!(
                            "teacher {} is not assigned to any of the requested courses",
                            identity.id
                        )));
                    }
                    Scope::Courses {
                        course_ids: permitted,
                    }
                }
            }
            Role::Student => {
                let student_id = StudentId::new(identity.id.clone());
                let student = self
                    .retry
                    .run("find_student", || self.backend.find_student(&student_id))
                    .await?
                    .ok_or_else(|| {
                        AnalyticsError::NotFound(format!("student {}", identity.id))
                    })?;
                Scope::Student {
                    student_id: student.id,
                    course_id: student.course_id,
                }
            }
        };

        debug!(role = ?identity.role, ?scope, "resolved selection scope");
        Ok(EffectiveSelection {
            scope,
            month: requested.month,
            granularity: requested.granularity,
        })
    }

    /// Check that `identity` may read the per-student log of `student_id`.
    pub async fn authorize_student(
        &self,
        identity: &Identity,
        student_id: &StudentId,
    ) -> AnalyticsResult<()> {
        let student = self
            .retry
            .run("find_student", || self.backend.find_student(student_id))
            .await?
            .ok_or_else(|| AnalyticsError::NotFound(format!("student {student_id}")))?;

        match identity.role {
            Role::Admin => Ok(()),
            Role::Teacher => {
                if self.assigned(&identity.id).await?.contains(&student.course_id) {
                    Ok(())
                } else {
                    Err(AnalyticsError::Authorization(format!(
                        "student {student_id} is outside teacher {}'s courses",
                        identity.id
                    )))
                }
            }
            Role::Student => {
                if identity.id == student_id.as_str() {
                    Ok(())
                } else {
                    Err(AnalyticsError::Authorization(
                        "students may only read their own attendance".to_string(),
                    ))
                }
            }
        }
    }

    async fn assigned(&self, teacher_id: &str) -> AnalyticsResult<BTreeSet<CourseId>> {
        self.retry
            .run("assigned_courses", || self.backend.assigned_courses(teacher_id))
            .await
    }

    async fn ensure_known(&self, requested: &BTreeSet<CourseId>) -> AnalyticsResult<()> {
        if requested.is_empty() {
            return Ok(());
        }
        let active: BTreeSet<CourseId> = self
            .retry
            .run("list_courses", || self.backend.list_courses())
            .await?
            .into_iter()
            .map(|course| course.id)
            .collect();

        match requested.difference(&active).next() {
            Some(unknown) => Err(AnalyticsError::NotFound(format!("course {unknown}"))),
            None => Ok(()),
        }
    }
}
