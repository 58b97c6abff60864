mod work_sessions;
