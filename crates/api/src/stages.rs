//! Fixed production pipeline every order moves through.

use platform_api::{ApiError, ApiResult};

pub const STAGE_COUNT: i16 = 5;
pub const FIRST_STAGE: i16 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Stage {
    pub number: i16,
    pub name: &'static str,
    pub description: &'static str,
}

pub const STAGES: [Stage; STAGE_COUNT as usize] = [
    Stage {
        number: 1,
        name: "Design Phase",
        description: "Creating the initial design and blueprint",
    },
    Stage {
        number: 2,
        name: "Casting Phase",
        description: "Casting the metal into the desired shape",
    },
    Stage {
        number: 3,
        name: "Polishing Phase",
        description: "Polishing and refining the surface",
    },
    Stage {
        number: 4,
        name: "Stone Setting",
        description: "Setting precious stones and gems",
    },
    Stage {
        number: 5,
        name: "Final Delivery",
        description: "Quality check and packaging",
    },
];

pub fn stage(number: i16) -> Option<&'static Stage> {
    STAGES.iter().find(|stage| stage.number == number)
}

pub fn stage_numbers() -> impl Iterator<Item = i16> {
    FIRST_STAGE..=STAGE_COUNT
}

/// Accept a caller-supplied stage number only when it names a catalog stage.
pub fn parse_stage(value: i32) -> ApiResult<i16> {
    i16::try_from(value)
        .ok()
        .filter(|number| stage(*number).is_some())
        .ok_or_else(|| {
            ApiError::validation(format!(
                "stage must be between {} and {}",
                FIRST_STAGE, STAGE_COUNT
            ))
        })
}
