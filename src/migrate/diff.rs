//! Compare a declared table with its introspected shape and plan the DDL
//! that brings the backend in line.

use crate::ast::Ddl;
use crate::db::TableInfo;
use crate::schema::{FieldType, Table};

/// Ordered DDL for one table plus the changes held back for lack of `force`.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub steps: Vec<Ddl>,
    pub skipped: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.skipped.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Change {
    Same,
    Widen,
    Narrow,
}

pub fn plan(table: &Table, found: Option<&TableInfo>, force: bool) -> Plan {
    let mut plan = Plan::default();
    let Some(found) = found else {
        plan.steps.push(Ddl::CreateTable(std::sync::Arc::new(table.clone())));
        return plan;
    };
    let name = table.name().to_string();

    let mut alters = Vec::new();
    for field in table.fields() {
        let Some(column) = found.column(&field.name) else {
            plan.steps.push(Ddl::AddColumn {
                table: name.clone(),
                field: field.clone(),
            });
            continue;
        };
        // Types the driver could not map back are left alone.
        let Some(found_type) = &column.field_type else {
            continue;
        };
        let mut change = compare_types(found_type, &field.field_type);
        let keyed = field.field_type == FieldType::Id || table.primary_key().contains(&field.name);
        if !keyed && column.nullable != field.nullable {
            let nullability = if field.nullable {
                Change::Widen
            } else {
                Change::Narrow
            };
            change = change.max(nullability);
        }
        match change {
            Change::Same => {}
            Change::Widen => alters.push(Ddl::AlterColumn {
                table: name.clone(),
                field: field.clone(),
            }),
            Change::Narrow if force => alters.push(Ddl::AlterColumn {
                table: name.clone(),
                field: field.clone(),
            }),
            Change::Narrow => plan.skipped.push(format!(
                "alter {name}.{} from {}{} to {}{}",
                field.name,
                found_type,
                null_note(column.nullable),
                field.field_type,
                null_note(field.nullable)
            )),
        }
    }
    plan.steps.extend(alters);

    for column in &found.columns {
        if table.get_field(&column.name).is_some() {
            continue;
        }
        if force {
            plan.steps.push(Ddl::DropColumn {
                table: name.clone(),
                column: column.name.clone(),
            });
        } else {
            plan.skipped.push(format!("drop column {name}.{}", column.name));
        }
    }

    for index in &table.options().indexes {
        if !found.indexes.contains(&index.name) {
            plan.steps.push(Ddl::CreateIndex {
                table: name.clone(),
                index: index.clone(),
            });
        }
    }
    plan
}

fn null_note(nullable: bool) -> &'static str {
    if nullable {
        ""
    } else {
        " not null"
    }
}

/// Normalise types that share one physical column type.
fn physical(t: &FieldType) -> FieldType {
    match t {
        FieldType::Id | FieldType::Reference { .. } => FieldType::Integer,
        // Drivers do not report the srid; compare by kind.
        FieldType::Geometry { .. } => FieldType::Geometry { srid: 0 },
        other => other.clone(),
    }
}

fn compare_types(found: &FieldType, declared: &FieldType) -> Change {
    let (found, declared) = (physical(found), physical(declared));
    if found == declared {
        return Change::Same;
    }
    let widens = match (&found, &declared) {
        (FieldType::String { length: a }, FieldType::String { length: b }) => b > a,
        (FieldType::String { .. }, FieldType::Text) => true,
        (FieldType::Integer, FieldType::Float) => true,
        (FieldType::Integer, FieldType::Decimal { precision, scale }) => {
            precision.saturating_sub(*scale) >= 19
        }
        (
            FieldType::Decimal {
                precision: p1,
                scale: s1,
            },
            FieldType::Decimal {
                precision: p2,
                scale: s2,
            },
        ) => s2 >= s1 && p2.saturating_sub(*s2) >= p1.saturating_sub(*s1),
        _ => false,
    };
    if widens {
        Change::Widen
    } else {
        Change::Narrow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ColumnInfo;
    use crate::schema::Field;

    fn person() -> Table {
        let table = Table::builder("person")
            .field(Field::new("id", FieldType::Id))
            .field(Field::new("name", FieldType::string(64)).not_null())
            .field(Field::new("age", FieldType::Integer))
            .index("person_name", ["name"], false)
            .build()
            .unwrap();
        (*table).clone()
    }

    fn column(name: &str, field_type: FieldType, nullable: bool) -> ColumnInfo {
        ColumnInfo {
            name: name.into(),
            type_name: field_type.to_string(),
            field_type: Some(field_type),
            nullable,
        }
    }

    fn found(columns: Vec<ColumnInfo>, indexes: &[&str]) -> TableInfo {
        TableInfo {
            name: "person".into(),
            columns,
            indexes: indexes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_missing_table_is_created() {
        let plan = plan(&person(), None, false);
        assert_eq!(plan.steps.len(), 1);
        assert!(matches!(&plan.steps[0], Ddl::CreateTable(t) if t.name() == "person"));
    }

    #[test]
    fn test_matching_table_needs_nothing() {
        let info = found(
            vec![
                column("id", FieldType::Integer, false),
                column("name", FieldType::string(64), false),
                column("age", FieldType::Integer, true),
            ],
            &["person_pkey", "person_name"],
        );
        assert!(plan(&person(), Some(&info), false).is_empty());
    }

    #[test]
    fn test_add_widen_and_index() {
        let info = found(
            vec![
                column("id", FieldType::Integer, false),
                column("name", FieldType::string(32), false),
            ],
            &[],
        );
        let plan = plan(&person(), Some(&info), false);
        assert!(plan.skipped.is_empty());
        assert!(matches!(&plan.steps[0], Ddl::AddColumn { field, .. } if field.name == "age"));
        assert!(matches!(&plan.steps[1], Ddl::AlterColumn { field, .. } if field.name == "name"));
        assert!(matches!(&plan.steps[2], Ddl::CreateIndex { index, .. } if index.name == "person_name"));
    }

    #[test]
    fn test_destructive_changes_need_force() {
        let info = found(
            vec![
                column("id", FieldType::Integer, false),
                column("name", FieldType::Text, true),
                column("age", FieldType::Integer, true),
                column("nickname", FieldType::Text, true),
            ],
            &["person_name"],
        );
        let held = plan(&person(), Some(&info), false);
        assert!(held.steps.is_empty());
        assert_eq!(held.skipped.len(), 2);
        assert!(held.skipped[1].contains("nickname"));

        let forced = plan(&person(), Some(&info), true);
        assert!(forced.skipped.is_empty());
        assert!(matches!(&forced.steps[0], Ddl::AlterColumn { field, .. } if field.name == "name"));
        assert!(matches!(&forced.steps[1], Ddl::DropColumn { column, .. } if column == "nickname"));
    }

    #[test]
    fn test_type_widening_rules() {
        assert_eq!(compare_types(&FieldType::Integer, &FieldType::Float), Change::Widen);
        assert_eq!(compare_types(&FieldType::Float, &FieldType::Integer), Change::Narrow);
        assert_eq!(
            compare_types(&FieldType::Integer, &FieldType::decimal(20, 1)),
            Change::Widen
        );
        assert_eq!(
            compare_types(&FieldType::Integer, &FieldType::decimal(10, 2)),
            Change::Narrow
        );
        assert_eq!(
            compare_types(&FieldType::decimal(10, 2), &FieldType::decimal(12, 3)),
            Change::Widen
        );
        assert_eq!(
            compare_types(&FieldType::decimal(10, 2), &FieldType::decimal(10, 3)),
            Change::Narrow
        );
        assert_eq!(
            compare_types(&FieldType::Integer, &FieldType::reference("person")),
            Change::Same
        );
        assert_eq!(
            compare_types(&FieldType::geometry(0), &FieldType::geometry(4326)),
            Change::Same
        );
    }

    #[test]
    fn test_unmapped_column_type_is_left_alone() {
        let mut name = column("name", FieldType::Text, false);
        name.field_type = None;
        let info = found(
            vec![
                column("id", FieldType::Integer, false),
                name,
                column("age", FieldType::Integer, true),
            ],
            &["person_name"],
        );
        assert!(plan(&person(), Some(&info), false).is_empty());
    }
}
