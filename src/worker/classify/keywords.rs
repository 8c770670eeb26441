//! Fixed mental-health keyword set.
//!
//! Phrases are matched case-insensitively on word boundaries. A straight
//! apostrophe also matches the typographic one, so "can't" covers "can’t".

/// Keyword phrases that mark a post as relevant.
pub const MENTAL_HEALTH_KEYWORDS: &[&str] = &[
    // General
    "mental health",
    "mental illness",
    "mental disorder",
    "mental breakdown",
    "mental fatigue",
    "psychological",
    "emotional health",
    "emotional support",
    "cognitive therapy",
    "psychotherapy",
    // Depression and low mood
    "clinical depression",
    "depression",
    "depressed",
    "hopeless",
    "worthless",
    "numb",
    "empty",
    "crying",
    "grief",
    "mourning",
    "loss",
    "low mood",
    "burnout",
    // Anxiety
    "anxiety",
    "anxious",
    "panic attack",
    "panic disorder",
    "worry",
    "nervous",
    "overwhelmed",
    "racing thoughts",
    "dread",
    "tension",
    // Self-harm and suicidal ideation
    "suicide",
    "suicidal",
    "self harm",
    "cutting",
    "attempted suicide",
    "taking my life",
    "ending it all",
    "thoughts of suicide",
    "hurting myself",
    "i want to die",
    "i want to end it",
    "i can't do this anymore",
    "life isn't worth it",
    "no reason to live",
    "ending my life",
    // Trauma
    "ptsd",
    "trauma",
    "flashbacks",
    "hypervigilance",
    "dissociation",
    "emotional numbness",
    "abuse trauma",
    "childhood trauma",
    "sexual trauma",
    // Diagnoses
    "bipolar",
    "ocd",
    "adhd",
    "borderline",
    "schizophrenia",
    "eating disorder",
    "anorexia",
    "bulimia",
    "personality disorder",
    // Treatment and support
    "therapy",
    "counseling",
    "counsellor",
    "therapist",
    "psychologist",
    "psychiatrist",
    "meds",
    "mental health treatment",
    "support group",
    "recovery",
    "mental health app",
    // Sleep and stress
    "insomnia",
    "sleep disorder",
    "can't sleep",
    "racing mind",
    "stressed",
    "stress",
    "burned out",
    "sleep paralysis",
];
