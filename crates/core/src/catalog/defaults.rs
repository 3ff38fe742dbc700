use crate::domain::intent::{Intent, IntentCategory};

pub(super) fn unknown() -> Intent {
    Intent::new(super::UNKNOWN_INTENT, IntentCategory::Unknown)
        .with_description("Unknown or unclassifiable intent")
        .with_handler("handle_unknown")
}

pub(super) fn ambiguous() -> Intent {
    Intent::new(super::AMBIGUOUS_INTENT, IntentCategory::Ambiguous)
        .with_description("Ambiguous intent requiring clarification")
        .with_handler("handle_ambiguous")
}

pub(super) fn built_in() -> Vec<Intent> {
    vec![
        // conversational
        Intent::new("greeting", IntentCategory::Greeting)
            .with_description("User greeting or starting conversation")
            .with_keywords(&[
                "hello",
                "hi",
                "hey",
                "good morning",
                "good afternoon",
                "good evening",
                "howdy",
                "greetings",
            ])
            .with_patterns(&[
                r"^(hey|hi|hello|howdy|greetings)\b",
                r"^good\s+(morning|afternoon|evening|day)",
            ])
            .with_examples(&["Hello!", "Hi there", "Hey, how are you?", "Good morning!"])
            .with_handler("handle_greeting")
            .with_priority(10),
        Intent::new("farewell", IntentCategory::Farewell)
            .with_description("User ending conversation")
            .with_keywords(&["bye", "goodbye", "see you", "later", "goodnight", "cya"])
            .with_patterns(&[r"\b(bye|goodbye|see\s+you|later|goodnight|cya)\b"])
            .with_examples(&["Bye!", "Goodbye", "See you later", "I'm heading out"])
            .with_handler("handle_farewell")
            .with_priority(10),
        Intent::new("gratitude", IntentCategory::Gratitude)
            .with_description("User expressing thanks")
            .with_keywords(&["thanks", "thank you", "appreciate", "grateful"])
            .with_patterns(&[r"\b(thanks|thank\s+you|thx|appreciate|grateful)\b"])
            .with_examples(&["Thanks!", "Thank you so much", "I appreciate it"])
            .with_handler("handle_gratitude")
            .with_priority(10),
        // file system and shell
        Intent::new("file_create", IntentCategory::SystemCommand)
            .with_description("Create a new file or directory")
            .with_keywords(&["create", "make", "new", "file", "folder", "directory", "touch", "mkdir"])
            .with_patterns(&[
                r"\b(create|make|new)\b.*\b(file|folder|directory)\b",
                r"\b(touch|mkdir)\b",
            ])
            .with_examples(&[
                "Create a new file called test.py",
                "Make a folder for the project",
                "Create directory src/components",
            ])
            .with_handler("handle_file_create")
            .with_required_slots(&["path"])
            .with_priority(20),
        Intent::new("file_read", IntentCategory::SystemCommand)
            .with_description("Read or view file contents")
            .with_keywords(&["read", "show", "view", "cat", "display", "open", "contents"])
            .with_patterns(&[
                r"\b(read|show|view|cat|display|open)\b.*\b(file|contents)\b",
                r"what('s| is) in",
            ])
            .with_examples(&[
                "Show me the contents of config.yaml",
                "Read the README file",
                "What's in package.json?",
            ])
            .with_handler("handle_file_read")
            .with_required_slots(&["path"])
            .with_priority(20),
        Intent::new("file_delete", IntentCategory::SystemCommand)
            .with_description("Delete files or directories")
            .with_keywords(&["delete", "remove", "rm", "unlink", "trash"])
            .with_patterns(&[r"\b(delete|remove|rm)\b.*\b(file|folder|directory)?\b"])
            .with_examples(&[
                "Delete the old log files",
                "Remove the temp directory",
                "rm -rf node_modules",
            ])
            .with_handler("handle_file_delete")
            .with_required_slots(&["path"])
            .requiring_confirmation()
            .with_priority(20),
        Intent::new("run_command", IntentCategory::SystemCommand)
            .with_description("Execute a shell command")
            .with_keywords(&["run", "execute", "exec", "shell", "terminal", "command"])
            .with_patterns(&[
                r"\b(run|execute|exec)\b",
                r"^(npm|yarn|pip|python|node|git|docker)\b",
            ])
            .with_examples(&["Run the tests", "Execute npm install", "Run git status"])
            .with_handler("handle_run_command")
            .with_required_slots(&["command"])
            .with_priority(15),
        // code
        Intent::new("code_generate", IntentCategory::CodeWrite)
            .with_description("Generate or write new code")
            .with_keywords(&[
                "write",
                "create",
                "generate",
                "implement",
                "code",
                "function",
                "class",
                "component",
            ])
            .with_patterns(&[
                r"\b(write|create|generate|implement|build|make)\b.*\b(function|class|component|module|api|endpoint)\b",
                r"\b(add|create)\b.*\b(feature|functionality)\b",
            ])
            .with_examples(&[
                "Write a function to validate emails",
                "Create a React component for the header",
                "Implement a binary search algorithm",
                "Generate an API endpoint for user registration",
            ])
            .with_negative_examples(&["Review this code", "Debug the login function"])
            .with_handler("handle_code_generate")
            .with_priority(25),
        Intent::new("code_debug", IntentCategory::CodeDebug)
            .with_description("Debug or fix code issues")
            .with_keywords(&[
                "debug",
                "fix",
                "error",
                "bug",
                "issue",
                "broken",
                "not working",
                "fails",
            ])
            .with_patterns(&[
                r"\b(debug|fix|solve|resolve)\b.*\b(error|bug|issue|problem)\b",
                r"\b(not working|broken|fails|failing|crashed)\b",
                r"why (is|does|isn't|doesn't)",
            ])
            .with_examples(&[
                "Debug the authentication error",
                "Fix this TypeError",
                "Why is this function returning null?",
                "The login isn't working",
            ])
            .with_handler("handle_code_debug")
            .with_priority(25),
        Intent::new("code_review", IntentCategory::CodeReview)
            .with_description("Review or analyze code")
            .with_keywords(&["review", "analyze", "check", "look at", "evaluate", "assess"])
            .with_patterns(&[
                r"\b(review|analyze|check|evaluate|assess)\b.*\b(code|function|class|file)\b",
                r"what do you think (of|about)",
            ])
            .with_examples(&[
                "Review this pull request",
                "Analyze the performance of this function",
                "Check my code for issues",
                "What do you think of this implementation?",
            ])
            .with_handler("handle_code_review")
            .with_priority(25),
        Intent::new("code_refactor", IntentCategory::CodeRefactor)
            .with_description("Refactor or improve existing code")
            .with_keywords(&[
                "refactor",
                "improve",
                "clean up",
                "optimize",
                "restructure",
                "simplify",
            ])
            .with_patterns(&[
                r"\b(refactor|improve|clean\s*up|optimize|restructure|simplify)\b",
                r"make (it|this|the code) (better|cleaner|more efficient)",
            ])
            .with_examples(&[
                "Refactor this function to be more readable",
                "Clean up this component",
                "Optimize the database queries",
                "Make this code more efficient",
            ])
            .with_handler("handle_code_refactor")
            .with_priority(25),
        // questions
        Intent::new("factual_question", IntentCategory::Question)
            .with_description("Ask a factual question")
            .with_keywords(&["what", "who", "when", "where", "how many", "how much"])
            .with_patterns(&[r"^(what|who|when|where|which)\b.*\?$", r"^how (many|much)\b"])
            .with_examples(&[
                "What is the capital of France?",
                "Who wrote this library?",
                "When was Python created?",
            ])
            .with_handler("handle_question")
            .with_priority(10),
        Intent::new("explanation_request", IntentCategory::Explanation)
            .with_description("Request an explanation")
            .with_keywords(&[
                "explain",
                "what is",
                "what are",
                "how does",
                "why does",
                "tell me about",
            ])
            .with_patterns(&[
                r"^(explain|describe)\b",
                r"^what (is|are)\b",
                r"^how does\b",
                r"^why (does|is|do|are)\b",
                r"^tell me (about|more)\b",
            ])
            .with_examples(&[
                "Explain how async/await works",
                "What is a closure?",
                "How does garbage collection work?",
                "Tell me about microservices",
            ])
            .with_handler("handle_explanation")
            .with_priority(15),
        Intent::new("web_search", IntentCategory::Search)
            .with_description("Search the web for information")
            .with_keywords(&["search", "find", "look up", "google", "research"])
            .with_patterns(&[
                r"\b(search|find|look\s*up|google|research)\b.*\b(for|about|on)\b",
                r"^(search|find)\b",
            ])
            .with_examples(&[
                "Search for the latest Python release",
                "Find information about React hooks",
                "Look up the Express.js documentation",
            ])
            .with_handler("handle_search")
            .with_priority(15),
        // productivity
        Intent::new("create_reminder", IntentCategory::Reminder)
            .with_description("Create a reminder")
            .with_keywords(&["remind", "reminder", "don't forget", "remember"])
            .with_patterns(&[
                r"\bremind\s+(me|us)\b",
                r"\bset\s+a?\s*reminder\b",
                r"\bdon't\s+(let\s+me\s+)?forget\b",
            ])
            .with_examples(&[
                "Remind me to call John at 3pm",
                "Set a reminder for the meeting tomorrow",
                "Don't let me forget to submit the report",
            ])
            .with_handler("handle_create_reminder")
            .with_optional_slots(&["time", "date", "message"])
            .with_priority(20),
        Intent::new("calendar_query", IntentCategory::Calendar)
            .with_description("Query calendar events")
            .with_keywords(&["calendar", "schedule", "meeting", "appointment", "event", "busy"])
            .with_patterns(&[
                r"\b(what's|what is)\s+(on\s+)?(my\s+)?(calendar|schedule)\b",
                r"\b(am\s+i|are\s+we)\s+(free|busy|available)\b",
                r"\b(any|what)\s+(meetings|appointments|events)\b",
            ])
            .with_examples(&[
                "What's on my calendar today?",
                "Am I free at 2pm?",
                "What meetings do I have tomorrow?",
            ])
            .with_handler("handle_calendar_query")
            .with_optional_slots(&["date", "time_range"])
            .with_priority(20),
        // help and settings
        Intent::new("help_request", IntentCategory::Help)
            .with_description("Request help or documentation")
            .with_keywords(&["help", "how to", "how do i", "tutorial", "guide", "documentation"])
            .with_patterns(&[
                r"^help\b",
                r"\bhow (do|can|should) i\b",
                r"\b(show|give)\s+me\s+(the\s+)?(help|docs|documentation)\b",
            ])
            .with_examples(&["Help", "How do I use this feature?", "Show me the documentation"])
            .with_handler("handle_help")
            .with_priority(10),
        Intent::new("settings_change", IntentCategory::Settings)
            .with_description("Change settings or preferences")
            .with_keywords(&[
                "settings",
                "configure",
                "config",
                "preference",
                "change",
                "set",
                "enable",
                "disable",
            ])
            .with_patterns(&[
                r"\b(change|update|set|modify)\s+(the\s+)?(settings?|config|preferences?)\b",
                r"\b(enable|disable|turn\s+(on|off))\b",
            ])
            .with_examples(&[
                "Change the theme to dark mode",
                "Enable voice commands",
                "Update my notification preferences",
            ])
            .with_handler("handle_settings")
            .with_priority(15),
        // control flow; high priority so they win ties
        Intent::new("cancel_action", IntentCategory::Cancel)
            .with_description("Cancel current action")
            .with_keywords(&["cancel", "stop", "abort", "nevermind", "never mind", "forget it"])
            .with_patterns(&[r"^(cancel|stop|abort|nevermind|never\s*mind|forget\s*it)\b"])
            .with_examples(&["Cancel", "Stop that", "Nevermind", "Abort the operation"])
            .with_handler("handle_cancel")
            .with_priority(30),
        Intent::new("undo_action", IntentCategory::Undo)
            .with_description("Undo last action")
            .with_keywords(&["undo", "revert", "rollback", "go back"])
            .with_patterns(&[r"^undo\b", r"\b(revert|rollback)\s+(the\s+)?(last|previous)\b"])
            .with_examples(&["Undo", "Revert the last change", "Go back"])
            .with_handler("handle_undo")
            .with_priority(30),
        // home automation
        Intent::new("lights_control", IntentCategory::HomeAutomation)
            .with_description("Control lights")
            .with_keywords(&["lights", "light", "lamp", "brightness", "dim"])
            .with_patterns(&[
                r"\b(turn|switch)\s+(on|off)\s+(the\s+)?lights?\b",
                r"\b(dim|brighten)\s+(the\s+)?lights?\b",
                r"\blights?\s+(on|off)\b",
            ])
            .with_examples(&["Turn on the lights", "Dim the living room lights", "Lights off"])
            .with_handler("handle_lights")
            .with_optional_slots(&["room", "brightness"])
            .with_priority(20),
        Intent::new("thermostat_control", IntentCategory::HomeAutomation)
            .with_description("Control thermostat/temperature")
            .with_keywords(&["temperature", "thermostat", "heat", "cool", "ac", "degrees"])
            .with_patterns(&[
                r"\bset\s+(the\s+)?temperature\s+to\b",
                r"\b(turn|switch)\s+(on|off|up|down)\s+(the\s+)?(heat|ac|air\s*conditioning)\b",
                r"\bmake\s+it\s+(warmer|cooler|hotter|colder)\b",
            ])
            .with_examples(&["Set the temperature to 72", "Turn up the heat", "Make it cooler in here"])
            .with_handler("handle_thermostat")
            .with_optional_slots(&["temperature", "mode"])
            .with_priority(20),
    ]
}
